/// Seed of the CRC16/MODBUS register.
pub const CRC16_MODBUS_INIT: u16 = 0xFFFF;
/// Reflected form of polynomial 0x8005.
pub const CRC16_MODBUS_POLY: u16 = 0xA001;

/// CRC16/MODBUS over `buf`.
pub fn crc16_modbus(buf: &[u8]) -> u16 {
    let mut crc = CRC16_MODBUS_INIT;

    for &byte in buf.iter() {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC16_MODBUS_POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// The checksum byte as transmitted on the wire: the low byte of
/// [crc16_modbus].
///
/// This only detects accidental corruption. It is not an authenticator.
pub fn checksum_byte(buf: &[u8]) -> u8 {
    (crc16_modbus(buf) & 0x00FF) as u8
}

/// Check that the last byte of `frame` is the [checksum_byte] of the bytes
/// preceding it. Returns `(expected, actual)` on mismatch.
pub fn verify_trailing_checksum(frame: &[u8]) -> Result<(), (u8, u8)> {
    let Some((&received, body)) = frame.split_last() else {
        return Err((0, 0));
    };
    let computed = checksum_byte(body);
    if received == computed {
        Ok(())
    } else {
        Err((computed, received))
    }
}
