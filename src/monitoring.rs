//! In this module, we implement the indicator (LED) signalling for the recorder.
//! Requests are fire-and-forget: the acquisition and buffer paths never wait on them,
//! and a full or missing channel just drops the blink.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// Scaled samples came close to clipping
    Overload,
    /// The buffer ring accepted a trigger
    Trigger,
}

#[derive(Debug, Clone, Default)]
pub struct Indicators {
    sender: Option<Sender<Indicator>>,
}

impl Indicators {
    pub fn new(sender: Sender<Indicator>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Indicators that go nowhere
    pub fn disconnected() -> Self {
        Self { sender: None }
    }

    pub fn blink(&self, indicator: Indicator) {
        if let Some(sender) = &self.sender {
            // We don't care if this errors
            if let Err(TrySendError::Full(_)) = sender.try_send(indicator) {
                trace!(?indicator, "indicator queue full");
            }
        }
    }
}

/// Drain indicator requests until every sender is gone
pub fn indicator_consumer(receiver: Receiver<Indicator>) {
    let mut overloads = 0u64;
    let mut triggers = 0u64;
    for indicator in receiver {
        match indicator {
            Indicator::Overload => {
                overloads += 1;
                debug!(overloads, "red blink");
            }
            Indicator::Trigger => {
                triggers += 1;
                debug!(triggers, "yellow blink");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_blink_never_blocks() {
        let (sender, receiver) = bounded(1);
        let indicators = Indicators::new(sender);
        indicators.blink(Indicator::Trigger);
        indicators.blink(Indicator::Overload);
        assert_eq!(receiver.try_recv(), Ok(Indicator::Trigger));
        assert!(receiver.try_recv().is_err());
        Indicators::disconnected().blink(Indicator::Overload);
    }
}
