// Encoder stderr monitoring.
//
// The encoder writes both diagnostics and progress to stderr. A dedicated
// reader thread classifies each line, forwards it to the log at the
// matching level, and retains the most recent progress line for metrics.

use log::{debug, error, warn};
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StderrClass {
    Error,
    Warning,
    Progress,
    Info,
}

pub(crate) fn classify_line(line: &str) -> StderrClass {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") {
        StderrClass::Error
    } else if lower.contains("warning") {
        StderrClass::Warning
    } else if line.contains("frame=") {
        StderrClass::Progress
    } else {
        StderrClass::Info
    }
}

/// Extract the frame counter from an encoder progress line, e.g.
/// `frame=  123 fps= 15 q=25.0 size=1024kB time=00:00:08.20 ...`.
pub(crate) fn parse_progress_frame(line: &str) -> Option<u64> {
    let rest = &line[line.find("frame=")? + "frame=".len()..];
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Spawn the stderr reader thread. Runs until the stream closes (encoder
/// exit) and never propagates errors.
pub(crate) fn spawn_stderr_monitor<R>(
    stderr: R,
    last_progress: Arc<Mutex<Option<String>>>,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new()
        .name("encoder-stderr".to_string())
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!("encoder stderr closed: {:?}", e);
                        break;
                    }
                };
                match classify_line(&line) {
                    StderrClass::Error => error!("encoder: {}", line),
                    StderrClass::Warning => warn!("encoder: {}", line),
                    StderrClass::Progress => {
                        debug!("encoder: {}", line);
                        *last_progress.lock().unwrap() = Some(line);
                    }
                    StderrClass::Info => debug!("encoder: {}", line),
                }
            }
        })
}
