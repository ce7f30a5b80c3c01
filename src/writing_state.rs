use std::{io::Write, path::PathBuf};

use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};

use launcher_link::LinkState;
use launcher_protocol::MachineCommand;
use rallie_core::{CalibrationStatus, CommandOutcome, CourtPoint, FloatType, MyTimestamp};

use crate::json_lines_writer::JsonLinesWriter;

const README_MD_FNAME: &str = "README.md";
const EVENTS_FNAME: &str = "events.jsonl";
const METADATA_FNAME: &str = "rallie-metadata.yaml";

/// One recorded controller event.
#[derive(Debug, PartialEq, Serialize, Clone)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Record {
    Position {
        /// Vision timestamp, seconds.
        timestamp: FloatType,
        raw: CourtPoint,
        smoothed: CourtPoint,
    },
    CommandSent {
        /// The frame as written, in hex.
        frame: String,
    },
    CommandResolved(CommandOutcome),
    LinkState(LinkState),
    Calibration(CalibrationStatus),
}

impl Record {
    pub(crate) fn command_sent(cmd: &MachineCommand) -> Self {
        let frame = cmd.to_bytes().iter().map(|b| format!("{b:02X}")).collect();
        Self::CommandSent { frame }
    }
}

#[derive(Debug)]
pub(crate) enum RecordMsg {
    Record(MyTimestamp, Record),
    Quit,
}

#[derive(Serialize)]
struct StampedRecord<'a> {
    received: MyTimestamp,
    #[serde(flatten)]
    record: &'a Record,
}

/// Attempt to shutdown writer.
///
/// This will not necessarily always work as drop is not guaranteed to be called.
pub(crate) struct WriteCloser {
    record_tx: tokio::sync::mpsc::UnboundedSender<RecordMsg>,
}

impl WriteCloser {
    pub(crate) fn new(record_tx: tokio::sync::mpsc::UnboundedSender<RecordMsg>) -> Self {
        Self { record_tx }
    }
}

impl Drop for WriteCloser {
    fn drop(&mut self) {
        tracing::trace!("quitting writer because WriteCloser dropped");
        if self.record_tx.send(RecordMsg::Quit).is_err() {
            tracing::debug!("writer already gone");
        }
    }
}

/// Listen to a Receiver for records and save them to disk.
///
/// This function only exits upon error, on [RecordMsg::Quit] or when the
/// Sender counterpart to the Receiver has closed. It blocks and does not use
/// an async context and thus should be spawned with
/// `tokio::task::spawn_blocking`. Without an `output_dirname`, records are
/// received and dropped.
#[tracing::instrument(skip_all)]
pub(crate) fn writer_task_main(
    mut record_rx: tokio::sync::mpsc::UnboundedReceiver<RecordMsg>,
    output: Option<(MyTimestamp, PathBuf)>,
) -> Result<()> {
    use std::time::{Duration, Instant};

    const FLUSH_INTERVAL: u64 = 1;
    let flush_interval = Duration::from_secs(FLUSH_INTERVAL);

    let mut writing_state = match output {
        Some((creation_time, output_dirname)) => {
            tracing::info!("Saving session to {}", output_dirname.display());
            Some(WritingState::new(creation_time, output_dirname)?)
        }
        None => None,
    };
    let mut last_flushed = Instant::now();

    while let Some(msg) = record_rx.blocking_recv() {
        match msg {
            RecordMsg::Quit => {
                break;
            }
            RecordMsg::Record(stamp, record) => {
                if let Some(ref mut ws) = writing_state {
                    ws.save(stamp, &record)?;
                }
            }
        }

        if last_flushed.elapsed() > flush_interval {
            if let Some(ref mut ws) = writing_state {
                ws.flush_all()?;
            }
            last_flushed = Instant::now();
        }
    }
    if let Some(ws) = writing_state.as_mut() {
        ws.flush_all()?;
        tracing::info!(
            "Done saving {} records to {}",
            ws.events_wtr.lines(),
            ws.output_dirname.display()
        );
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
struct SessionMetadata {
    git_revision: String,
    creation_time: chrono::DateTime<chrono::FixedOffset>,
    timezone: String,
}

struct WritingState {
    output_dirname: PathBuf,
    /// The readme file in the output directory.
    ///
    /// We keep this file open to establish locking on the open directory.
    #[allow(dead_code)]
    readme_fd: std::fs::File,
    events_wtr: JsonLinesWriter<Box<dyn Write + Send>>,
}

fn _test_writing_state_is_send() {
    // Compile-time test to ensure WritingState implements Send trait.
    fn implements<T: Send>() {}
    implements::<WritingState>();
}

fn readme_contents() -> String {
    format!(
        "\n\nThis is a session recorded by {}. Each line of {EVENTS_FNAME} is one event.\n\n",
        env!("CARGO_PKG_NAME")
    )
}

impl WritingState {
    fn new(creation_time_local: MyTimestamp, output_dirname: PathBuf) -> Result<Self> {
        let creation_time = creation_time_local.with_timezone(creation_time_local.offset());

        std::fs::create_dir_all(&output_dirname)?;

        let readme_fd = {
            let mut fd = std::fs::File::create_new(output_dirname.join(README_MD_FNAME))?;
            fd.write_all(readme_contents().as_bytes())?;
            fd
        };

        {
            let metadata = SessionMetadata {
                git_revision: env!("GIT_HASH").trim().to_string(),
                creation_time,
                timezone: iana_time_zone::get_timezone()?,
            };
            let metadata_buf = serde_yaml::to_string(&metadata)?;
            let mut fd = std::fs::File::create(output_dirname.join(METADATA_FNAME))?;
            fd.write_all(metadata_buf.as_bytes())?;
        }

        let events_wtr = {
            let wtr = Box::new(bufwriter(output_dirname.join(EVENTS_FNAME))?);
            JsonLinesWriter::from_writer(wtr as Box<dyn Write + Send>)
        };

        Ok(Self {
            output_dirname,
            readme_fd,
            events_wtr,
        })
    }

    fn save(&mut self, received: MyTimestamp, record: &Record) -> Result<()> {
        self.events_wtr.serialize(StampedRecord { received, record })?;
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        self.events_wtr.flush()?;
        Ok(())
    }
}

fn bufwriter(path: PathBuf) -> std::io::Result<std::io::BufWriter<std::fs::File>> {
    Ok(std::io::BufWriter::new(std::fs::File::create(path)?))
}
