use std::time::{Duration, Instant};

use bytes::Bytes;
use nalgebra::{Matrix3, Vector3};

use launcher_link::{
    CharacteristicId, Characteristics, CommandError, LinkSession, LinkState, PeripheralId,
    SendError, Transport, TransportError, TransportEvent, DEFAULT_ACK_TIMEOUT,
};
use launcher_protocol::{AckFrame, MachineCommand, ResponseCode};
use rallie_core::{
    homography::{CalibrationSet, Correspondence, HomographyEngine},
    planner::{CommandPlanner, PositionSample},
    position_filter::PositionFilter,
    CommandOutcome, CourtConfig, CourtPoint, FilterConfig, PixelPoint, PlannerConfig,
};

#[derive(Default)]
struct FakeTransport {
    writes: Vec<Vec<u8>>,
}

impl Transport for FakeTransport {
    fn start_scan(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
    fn connect(&mut self, _: &PeripheralId) -> Result<(), TransportError> {
        Ok(())
    }
    fn discover_services(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
    fn write(&mut self, _: &CharacteristicId, frame: &[u8]) -> Result<(), TransportError> {
        self.writes.push(frame.to_vec());
        Ok(())
    }
    fn disconnect(&mut self) {}
}

fn characteristics() -> Characteristics {
    Characteristics {
        command: CharacteristicId("ffe1".into()),
        notify: CharacteristicId("ffe2".into()),
    }
}

fn connect(session: &mut LinkSession<FakeTransport>, now: Instant) -> eyre::Result<()> {
    session.start()?;
    session.handle_event(TransportEvent::PeripheralFound(PeripheralId("launcher".into())), now);
    session.handle_event(TransportEvent::Connected, now);
    session.handle_event(TransportEvent::ServicesDiscovered(characteristics()), now);
    assert_eq!(session.state(), LinkState::ConnectedIdle);
    Ok(())
}

fn accepted_ack() -> TransportEvent {
    TransportEvent::Notification {
        characteristic: characteristics().notify,
        data: Bytes::copy_from_slice(&AckFrame::new(ResponseCode::Accepted).to_bytes()),
    }
}

/// Court-to-image transform of a camera looking down the court.
fn camera() -> Matrix3<f64> {
    Matrix3::new(80.0, 10.0, 300.0, 0.0, -40.0, 700.0, 0.0, 0.05, 1.0)
}

fn to_image(p: CourtPoint) -> PixelPoint {
    let q = camera() * Vector3::new(p.x, p.y, 1.0);
    PixelPoint::new(q[0] / q[2], q[1] / q[2])
}

fn calibrated_engine(court: CourtConfig) -> eyre::Result<HomographyEngine> {
    let correspondences = court
        .tap_corners()
        .into_iter()
        .chain(court.derived_references())
        .map(|c| Correspondence {
            image: to_image(c),
            court: c,
        })
        .collect();
    let engine = HomographyEngine::new(court);
    let calib = engine.calibrate(CalibrationSet::new(correspondences)?)?;
    assert!(calib.residual_m < 0.05);
    Ok(engine)
}

struct Rig {
    court: CourtConfig,
    engine: HomographyEngine,
    filter: PositionFilter,
    planner: CommandPlanner,
    session: LinkSession<FakeTransport>,
    t0: Instant,
    send_times: Vec<f64>,
    outcomes: Vec<CommandOutcome>,
}

impl Rig {
    fn new(launch_interval: f64) -> eyre::Result<Self> {
        let court = CourtConfig::default();
        let engine = calibrated_engine(court)?;
        let planner = CommandPlanner::new(
            court,
            &PlannerConfig {
                default_launch_interval_secs: launch_interval,
                start_active: true,
                ..Default::default()
            },
        )?;
        let t0 = Instant::now();
        let mut session = LinkSession::new(FakeTransport::default(), DEFAULT_ACK_TIMEOUT);
        connect(&mut session, t0)?;
        Ok(Self {
            court,
            engine,
            filter: PositionFilter::new(FilterConfig::default()),
            planner,
            session,
            t0,
            send_times: vec![],
            outcomes: vec![],
        })
    }

    fn at(&self, t: f64) -> Instant {
        self.t0 + Duration::from_secs_f64(t)
    }

    /// One camera frame at 30 Hz frame index `k`. Returns the attempt result
    /// if the planner tried to send.
    fn frame(&mut self, k: u32, ack: bool) -> eyre::Result<Option<Result<MachineCommand, SendError>>> {
        let t = k as f64 / 30.0;
        let now = self.at(t);
        self.session.poll_timeout(now);
        if let Some(outcome) = self.planner.poll_outcome() {
            self.outcomes.push(outcome);
        }

        // Every tenth frame the detector misses the player.
        if k % 10 == 7 {
            return Ok(None);
        }
        let jitter = if k % 2 == 0 { 1.5 } else { -1.5 };
        let center = to_image(self.court.center());
        let pixel = PixelPoint::new(center.x + jitter, center.y - jitter);

        let raw = self.engine.project_corrected(pixel)?;
        let Some(smooth) = self.filter.update(raw, t) else {
            return Ok(None);
        };
        let mut sink = self.session.sink_at(now);
        let attempt = self.planner.on_position(
            PositionSample {
                point: smooth,
                timestamp: t,
            },
            &mut sink,
        );
        if let Some(Ok(_)) = &attempt {
            self.send_times.push(t);
            if ack {
                self.session
                    .handle_event(accepted_ack(), now + Duration::from_millis(40));
                if let Some(outcome) = self.planner.poll_outcome() {
                    self.outcomes.push(outcome);
                }
            }
        }
        Ok(attempt)
    }
}

#[test]
fn stationary_player_at_center() -> eyre::Result<()> {
    let mut rig = Rig::new(3.0)?;
    for k in 0..=300 {
        rig.frame(k, true)?;
    }

    assert_eq!(rig.send_times, vec![0.0, 3.0, 6.0, 9.0]);
    let writes = &rig.session.transport().writes;
    assert_eq!(writes.len(), 4);
    for frame in writes {
        let cmd = MachineCommand::from_bytes(frame)?;
        assert!((44..=46).contains(&cmd.yaw()), "yaw {}", cmd.yaw());
        assert!((44..=46).contains(&cmd.pitch()), "pitch {}", cmd.pitch());
        assert_eq!((cmd.upper_wheel(), cmd.lower_wheel()), (63, 63));
    }
    assert_eq!(
        rig.outcomes,
        vec![CommandOutcome::Acknowledged(ResponseCode::Accepted); 4]
    );

    let position = rig.filter.position().ok_or_else(|| eyre::eyre!("no position"))?;
    assert!(position.distance(&rig.court.center()) < 0.05);
    Ok(())
}

#[test]
fn unacknowledged_commands_time_out_without_retry() -> eyre::Result<()> {
    let mut rig = Rig::new(3.0)?;
    for k in 0..=300 {
        rig.frame(k, false)?;
    }
    // Each command times out after 2 s, before the next one is due.
    assert_eq!(rig.send_times, vec![0.0, 3.0, 6.0, 9.0]);
    assert_eq!(
        rig.outcomes,
        vec![CommandOutcome::Failed(CommandError::Timeout); 3]
    );
    assert_eq!(rig.session.state(), LinkState::AwaitingAck);
    Ok(())
}

#[test]
fn link_loss_skips_a_slot_and_recovers() -> eyre::Result<()> {
    let mut rig = Rig::new(3.0)?;
    let mut refused = vec![];
    for k in 0..=300 {
        if k == 120 {
            let now = rig.at(4.0);
            rig.session.handle_event(
                TransportEvent::Disconnected {
                    reason: "out of range".into(),
                },
                now,
            );
        }
        if k == 210 {
            let now = rig.at(7.0);
            connect(&mut rig.session, now)?;
        }
        if let Some(Err(e)) = rig.frame(k, true)? {
            refused.push((k, e));
        }
    }
    assert_eq!(refused, vec![(180, SendError::NotConnected)]);
    assert_eq!(rig.send_times, vec![0.0, 3.0, 9.0]);
    assert_eq!(rig.session.transport().writes.len(), 3);
    Ok(())
}
