//! Polled hardware mailbox

use super::Transport;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use std::time::Duration;

pub const MAILBOX_SYSC: usize = 0x10;
pub const MAILBOX_MSG: usize = 0x40;
pub const MAILBOX_FIFO_STATUS: usize = 0x80;
pub const MAILBOX_MSG_STATUS: usize = 0xC0;

/// Message SRAM the core writes requests into
pub const MAILBOX_TX_REGION: u32 = 0x7081_4000;
/// Message SRAM the firmware writes responses into
pub const MAILBOX_RX_REGION: u32 = 0x7081_5000;

/// Register bank of the mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bank {
    Tx,
    Rx,
}

/// Mapped mailbox registers and message SRAM.
///
/// Reading [`MAILBOX_MSG`] pops the head of the bank's FIFO, hence
/// `&mut self` on reads.
pub trait MailboxWindow: Send {
    fn read32(&mut self, bank: Bank, offset: usize) -> u32;

    fn write32(&mut self, bank: Bank, offset: usize, value: u32);

    /// Copy `data` into message SRAM at physical address `addr`.
    fn write_sram(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    /// Copy from message SRAM at physical address `addr` into `out`.
    fn read_sram(&mut self, addr: u32, out: &mut [u8]) -> Result<()>;
}

/// [`Transport`] over a polled mailbox
pub struct MailboxTransport<W: MailboxWindow> {
    window: W,
    config: TransportConfig,
}

impl<W: MailboxWindow> MailboxTransport<W> {
    pub fn new(window: W, config: TransportConfig) -> Self {
        tracing::info!(
            "Mailbox ready: tx sram {:#x}, rx sram {:#x}, max message {} bytes",
            MAILBOX_TX_REGION,
            MAILBOX_RX_REGION,
            config.max_message_size
        );
        Self { window, config }
    }

    pub fn window(&self) -> &W {
        &self.window
    }

    pub fn into_inner(self) -> W {
        self.window
    }

    fn rx_pending(&mut self) -> u32 {
        self.window.read32(Bank::Rx, MAILBOX_MSG_STATUS)
    }

    /// Wait until at least one message is pending on the receive side.
    fn poll_rx(&mut self) -> Result<()> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut retries = self.config.poll_retries;

        while self.rx_pending() == 0 {
            if retries == 0 {
                tracing::warn!("Mailbox RX status polling timed out");
                return Err(Error::Transport("RX status polling timed out".to_string()));
            }
            retries -= 1;
            std::thread::sleep(interval);
        }
        Ok(())
    }
}

impl<W: MailboxWindow> Transport for MailboxTransport<W> {
    fn send(&mut self, msg: &[u8]) -> Result<()> {
        if self.window.read32(Bank::Tx, MAILBOX_FIFO_STATUS) != 0 {
            tracing::error!("Mailbox TX FIFO is not empty");
            return Err(Error::Transport("TX FIFO is not empty".to_string()));
        }
        if msg.len() > self.config.max_message_size {
            return Err(Error::Transport(format!(
                "message of {} bytes exceeds the {} byte limit",
                msg.len(),
                self.config.max_message_size
            )));
        }

        self.window.write_sram(MAILBOX_TX_REGION, msg)?;
        self.window.write32(Bank::Tx, MAILBOX_MSG, MAILBOX_TX_REGION);
        tracing::debug!("Sent message of length {}", msg.len());
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<()> {
        self.poll_rx()?;

        let addr = self.window.read32(Bank::Rx, MAILBOX_MSG);
        if addr != MAILBOX_RX_REGION {
            tracing::error!("Message address {:#x} is not valid", addr);
            return Err(Error::Transport(format!("invalid message address {:#x}", addr)));
        }
        if buf.len() > self.config.max_message_size {
            return Err(Error::Transport(format!(
                "receive length {} exceeds the {} byte limit",
                buf.len(),
                self.config.max_message_size
            )));
        }

        self.window.read_sram(addr, buf)
    }

    fn clear_pending(&mut self) -> Result<()> {
        let mut tries = match self.config.clear_retries {
            Some(limit) => limit,
            None => self.rx_pending(),
        };

        while self.rx_pending() != 0 {
            self.window.read32(Bank::Rx, MAILBOX_MSG);
            if tries == 0 {
                tracing::warn!("Mailbox RX queue did not drain");
                return Err(Error::Transport("RX queue did not drain".to_string()));
            }
            tries -= 1;
        }

        tracing::debug!("Mailbox RX queue cleared, {} tries left", tries);
        Ok(())
    }
}
