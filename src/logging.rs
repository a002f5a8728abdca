//! Log output for hosts embedding the engine: formatted lines go to stderr
//! and, when a channel is given, to every live broadcast subscriber.

use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
pub struct BroadcastMakeWriter {
    pub sender: Option<broadcast::Sender<String>>,
    pub suppress_stderr: bool,
}

impl<'a> MakeWriter<'a> for BroadcastMakeWriter {
    type Writer = BroadcastWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BroadcastWriter {
            sender: self.sender.clone(),
            suppress_stderr: self.suppress_stderr,
        }
    }
}

pub struct BroadcastWriter {
    sender: Option<broadcast::Sender<String>>,
    suppress_stderr: bool,
}

impl std::io::Write for BroadcastWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(sender) = &self.sender {
            // No receivers is fine.
            let _ = sender.send(String::from_utf8_lossy(buf).into_owned());
        }
        if !self.suppress_stderr {
            std::io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stderr {
            std::io::stderr().flush()?;
        }
        Ok(())
    }
}

/// Installs the global subscriber. Returns false if one was already set.
pub fn init(level: Level, sender: Option<broadcast::Sender<String>>) -> bool {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(BroadcastMakeWriter {
            sender,
            suppress_stderr: false,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn lines_reach_subscribers() {
        let (tx, mut rx) = broadcast::channel(8);
        let make = BroadcastMakeWriter {
            sender: Some(tx),
            suppress_stderr: true,
        };
        let mut writer = make.make_writer();
        writer.write_all(b"chain 4 finished\n").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "chain 4 finished\n");
    }

    #[test]
    fn writing_without_receivers_succeeds() {
        let (tx, rx) = broadcast::channel::<String>(8);
        drop(rx);
        let make = BroadcastMakeWriter {
            sender: Some(tx),
            suppress_stderr: true,
        };
        assert_eq!(make.make_writer().write(b"x").unwrap(), 1);
    }
}
