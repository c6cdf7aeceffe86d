//! Control-thread side of the command channel
//!
//! [`TransportControl`] owns the producer end of the command ring and the
//! consumer end of the acknowledgment ring. It stamps every command with a
//! serial number and lets the caller wait, with a bounded timeout, until the
//! audio thread reports that serial as applied.
//!
//! Waiting never involves a lock the audio thread could need: acks are polled
//! from a wait-free ring with spin/yield backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

use super::command::{Command, CommandSerial, Envelope};
use super::error::{EngineError, EngineResult};

/// Sends commands to the audio thread and waits for their acknowledgment
pub struct TransportControl {
    producer: rtrb::Producer<Envelope>,
    acks: rtrb::Consumer<CommandSerial>,
    /// Serials the audio thread could not acknowledge (ack ring full)
    dropped_acks: Arc<AtomicU64>,
    /// Drop count already reported in the log
    reported_drops: u64,
    /// Drop count when the last command was accepted
    drops_at_send: u64,
    next_serial: u64,
    last_acked: Option<CommandSerial>,
}

impl TransportControl {
    pub(crate) fn new(
        producer: rtrb::Producer<Envelope>,
        acks: rtrb::Consumer<CommandSerial>,
        dropped_acks: Arc<AtomicU64>,
    ) -> Self {
        Self {
            producer,
            acks,
            dropped_acks,
            reported_drops: 0,
            drops_at_send: 0,
            next_serial: 1,
            last_acked: None,
        }
    }

    /// Submit a command without blocking
    ///
    /// Returns false if a command is already pending; the rejected command is
    /// dropped. Use [`TransportControl::send`] to get it back instead.
    pub fn try_send(&mut self, command: Command) -> bool {
        self.send(command).is_ok()
    }

    /// Submit a command, returning its serial, or the command if rejected
    pub fn send(&mut self, command: Command) -> Result<CommandSerial, Command> {
        if self.producer.slots() == 0 {
            return Err(command);
        }
        let serial = CommandSerial(self.next_serial);
        let drops = self.dropped_acks();
        match self.producer.push(Envelope { serial, command }) {
            Ok(()) => {
                self.next_serial += 1;
                self.drops_at_send = drops;
                Ok(serial)
            }
            Err(rtrb::PushError::Full(envelope)) => Err(envelope.command),
        }
    }

    /// Whether a command is waiting to be taken by the audio thread
    pub fn is_pending(&self) -> bool {
        self.producer.slots() == 0
    }

    /// Drain the ack ring; returns the most recent serial acknowledged so far
    pub fn poll_acks(&mut self) -> Option<CommandSerial> {
        while let Ok(serial) = self.acks.pop() {
            self.last_acked = Some(serial);
        }
        self.report_dropped_acks();
        self.last_acked
    }

    /// Number of acknowledgments the audio thread had to drop
    pub fn dropped_acks(&self) -> u64 {
        self.dropped_acks.load(Ordering::Relaxed)
    }

    fn report_dropped_acks(&mut self) -> bool {
        let dropped = self.dropped_acks();
        if dropped > self.reported_drops {
            log::warn!(
                "Audio thread dropped {} command acknowledgment(s) (ack ring full)",
                dropped - self.reported_drops
            );
            self.reported_drops = dropped;
            return true;
        }
        false
    }

    /// Wait until `serial` has been applied, up to `timeout`
    ///
    /// If an acknowledgment was dropped since the last send, the command
    /// counts as applied once it has left the command ring.
    pub fn wait_for_ack(&mut self, serial: CommandSerial, timeout: Duration) -> EngineResult<()> {
        let started = Instant::now();
        let backoff = Backoff::new();
        let drops_before = self.drops_at_send;

        loop {
            if self.poll_acks().is_some_and(|acked| acked >= serial) {
                return Ok(());
            }
            if !self.is_pending() && self.dropped_acks() > drops_before {
                log::debug!("Command {} taken but its ack was dropped", serial);
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(EngineError::AckTimeout {
                    serial,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(250));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Send a command and wait for it, retrying a rejected send
    ///
    /// Each attempt waits up to `timeout` for the ring slot to free up before
    /// trying again. Fails with `CommandRejected` after `retries` retries.
    pub fn send_and_wait(
        &mut self,
        command: Command,
        timeout: Duration,
        retries: u32,
    ) -> EngineResult<CommandSerial> {
        let mut command = command;
        let mut attempt = 0;
        loop {
            match self.send(command) {
                Ok(serial) => {
                    self.wait_for_ack(serial, timeout)?;
                    return Ok(serial);
                }
                Err(rejected) => {
                    if attempt >= retries {
                        return Err(EngineError::CommandRejected(rejected.name()));
                    }
                    attempt += 1;
                    log::debug!(
                        "{} rejected (command pending), retry {}/{}",
                        rejected.name(),
                        attempt,
                        retries
                    );
                    command = rejected;
                    self.wait_for_slot(timeout);
                }
            }
        }
    }

    fn wait_for_slot(&self, timeout: Duration) {
        let started = Instant::now();
        let backoff = Backoff::new();
        while self.is_pending() && started.elapsed() < timeout {
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(250));
            } else {
                backoff.snooze();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::command::command_channel;

    fn control_pair(
        ack_capacity: usize,
    ) -> (
        TransportControl,
        rtrb::Consumer<Envelope>,
        rtrb::Producer<CommandSerial>,
        Arc<AtomicU64>,
    ) {
        let (tx, rx) = command_channel();
        let (ack_tx, ack_rx) = rtrb::RingBuffer::new(ack_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        (
            TransportControl::new(tx, ack_rx, Arc::clone(&dropped)),
            rx,
            ack_tx,
            dropped,
        )
    }

    #[test]
    fn test_second_send_rejected() {
        let (mut control, mut rx, _ack_tx, _) = control_pair(4);
        assert!(control.try_send(Command::Seek { frame: 3000 }));
        assert!(control.is_pending());
        let rejected = control.send(Command::Seek { frame: 5000 });
        assert!(matches!(rejected, Err(Command::Seek { frame: 5000 })));

        let envelope = rx.pop().unwrap();
        assert_eq!(envelope.serial, CommandSerial(1));
        assert!(!control.is_pending());
    }

    #[test]
    fn test_serials_increase_only_on_accept() {
        let (mut control, mut rx, _ack_tx, _) = control_pair(4);
        assert_eq!(control.send(Command::Wait).unwrap(), CommandSerial(1));
        assert!(control.send(Command::Wait).is_err());
        rx.pop().unwrap();
        assert_eq!(control.send(Command::Wait).unwrap(), CommandSerial(2));
    }

    #[test]
    fn test_wait_for_ack() {
        let (mut control, mut rx, mut ack_tx, _) = control_pair(4);
        let serial = control.send(Command::Panic).unwrap();
        let envelope = rx.pop().unwrap();
        ack_tx.push(envelope.serial).unwrap();
        assert!(control.wait_for_ack(serial, Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn test_wait_times_out_without_ack() {
        let (mut control, _rx, _ack_tx, _) = control_pair(4);
        let serial = control.send(Command::Wait).unwrap();
        let err = control
            .wait_for_ack(serial, Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, EngineError::AckTimeout { .. }));
    }

    #[test]
    fn test_dropped_ack_counts_as_applied() {
        let (mut control, mut rx, _ack_tx, dropped) = control_pair(1);
        let serial = control.send(Command::Wait).unwrap();
        let audio = std::thread::spawn(move || {
            let _envelope = rx.pop().unwrap();
            std::thread::sleep(Duration::from_millis(5));
            // Ack ring full: the serial is dropped
            dropped.fetch_add(1, Ordering::Relaxed);
        });
        assert!(control.wait_for_ack(serial, Duration::from_secs(2)).is_ok());
        audio.join().unwrap();
        assert_eq!(control.dropped_acks(), 1);
    }

    #[test]
    fn test_send_and_wait_gives_up_after_retries() {
        let (mut control, _rx, _ack_tx, _) = control_pair(4);
        assert!(control.try_send(Command::Wait));
        let err = control
            .send_and_wait(Command::ReSync, Duration::from_millis(2), 2)
            .unwrap_err();
        assert!(matches!(err, EngineError::CommandRejected("ReSync")));
    }
}
