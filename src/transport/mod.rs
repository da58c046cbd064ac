//! Message transport to the system firmware
//!
//! The core talks to the device-management firmware through a fixed-size
//! message channel. [`Transport`] is the byte-oriented contract;
//! [`MailboxTransport`] implements it over a polled hardware mailbox.

mod mailbox;

pub use mailbox::{
    Bank, MailboxTransport, MailboxWindow, MAILBOX_FIFO_STATUS, MAILBOX_MSG, MAILBOX_MSG_STATUS,
    MAILBOX_RX_REGION, MAILBOX_SYSC, MAILBOX_TX_REGION,
};

use crate::error::Result;

/// Bounded, polled message channel.
pub trait Transport: Send {
    /// Post one message. Fails if the channel is busy or the message is too large.
    fn send(&mut self, msg: &[u8]) -> Result<()>;

    /// Wait for one message and copy it into `buf`, timing out after the
    /// configured number of polls.
    fn receive(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Drop every message already pending on the receive side.
    fn clear_pending(&mut self) -> Result<()>;
}
