//! The client protocol on top of a device: discovery, property access and measurement runs.
//!
//! While a run is active the DMA engine streams measurement records into the ring buffer and
//! raises an interrupt whenever a message ends or the buffer wraps. [`Session::drain_dma`] relays
//! the new bytes to the client as they are, keeping the tail of the buffer after a wrap so the
//! stream the client sees has no gaps and no repeats.

use crate::{
    backend::Backend,
    codec::encode_str,
    cores::{
        dma::IRQ_MEM_END,
        HardwareCore,
    },
    device::Device,
    encode_all,
    error::{
        Error,
        Result,
    },
    messages::{
        MessageId,
        MessageSink,
        PropertyId,
    },
    settings::Timing,
};
use num_traits::FromPrimitive;
use std::{
    thread,
    time::{
        Duration,
        Instant,
    },
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

/// Index clients use to address the timer
const TIMER_ADDRESS: u8 = 0xFF;

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    /// Where the next read of the ring buffer starts
    last_dma_idx: usize,
    /// Tail of the buffer left over by the last wrap, sent ahead of the next read
    pending: Vec<u8>,
}

#[derive(Debug)]
pub struct Session<B: Backend, S: MessageSink> {
    device: Device<B>,
    sink: S,
    timing: Timing,
    hello: bool,
    run: RunState,
}

impl<B: Backend, S: MessageSink> Session<B, S> {
    #[must_use]
    pub fn new(device: Device<B>, sink: S, timing: Timing) -> Self {
        Self {
            device,
            sink,
            timing,
            hello: false,
            run: RunState::default(),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Device<B> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<B> {
        &mut self.device
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    #[must_use]
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run.running
    }

    /// A new client attached, it has to say hello before anything else
    pub fn client_connected(&mut self) {
        self.hello = false;
    }

    pub fn client_disconnected(&mut self) {
        self.hello = false;
        if self.run.running {
            info!("Client left during a run");
            if let Err(e) = self.stop_run() {
                error!(error = %e, "Failed to stop the run");
            }
        }
    }

    /// Act on a message from the client
    pub fn handle_message(&mut self, id: u16, payload: &[u8]) {
        let Some(id) = MessageId::from_u16(id) else {
            debug!(id, "Ignoring unknown message");
            return;
        };
        if id == MessageId::Hello {
            self.on_hello();
            return;
        }
        if !self.hello {
            debug!(?id, "Ignoring message sent before hello");
            return;
        }
        match id {
            MessageId::ProgramPl => self.on_program_pl(payload),
            MessageId::RunStart => self.start_run(),
            MessageId::RunStop => {
                if let Err(e) = self.stop_run() {
                    error!(error = %e, "Failed to stop the run");
                }
            }
            MessageId::SetProperty => self.on_set_property(payload),
            MessageId::GetProperty => self.on_get_property(payload),
            _ => {}
        }
    }

    fn on_hello(&mut self) {
        if self.hello {
            return;
        }
        self.hello = true;
        let mut list = vec![];
        for name in self.device.catalog().names() {
            encode_str(&mut list, name);
        }
        self.sink.send_message(MessageId::Hello, &list);
        self.send_program_pl(true);
    }

    /// Report the outcome of a bitstream load with the cores now present
    fn send_program_pl(&mut self, ok: bool) {
        let mut msg = vec![u8::from(ok)];
        encode_str(
            &mut msg,
            self.device.active_bitstream().unwrap_or_default(),
        );
        self.device.announce(&mut msg);
        self.sink.send_message(MessageId::ProgramPl, &msg);
    }

    fn on_program_pl(&mut self, payload: &[u8]) {
        if payload.len() < 3 {
            return;
        }
        let len = usize::from(u16::from_le_bytes([payload[0], payload[1]]));
        let name = &payload[2..(2 + len).min(payload.len())];
        let name = String::from_utf8_lossy(name);
        let ok = match self.program_pl(&name) {
            Ok(()) => true,
            Err(e) => {
                error!(bitstream = %name, error = %e, "Failed to load bitstream");
                false
            }
        };
        self.send_program_pl(ok);
    }

    /// Stop any run and load `name`
    /// # Errors
    /// Returns an error if the bitstream fails to load
    pub fn program_pl(&mut self, name: &str) -> Result<()> {
        if self.run.running {
            if let Err(e) = self.stop_run() {
                warn!(error = %e, "Run didn't stop cleanly before loading a bitstream");
            }
        }
        self.run = RunState::default();
        self.device.load_bitstream(name)
    }

    fn on_set_property(&mut self, payload: &[u8]) {
        if payload.len() < 3 {
            return;
        }
        let (index, raw_prop, value) = (payload[0], u16::from_le_bytes([payload[1], payload[2]]), &payload[3..]);
        let ok = match (PropertyId::from_u16(raw_prop), self.device.core_mut(index)) {
            (Some(prop), Some(core)) => core
                .set_property(prop, value)
                .map_err(|e| debug!(index, ?prop, error = %e, "Property write rejected"))
                .is_ok(),
            _ => false,
        };
        let mut msg = vec![];
        encode_all!(&mut msg, index, raw_prop, u8::from(ok));
        msg.extend_from_slice(value);
        self.sink.send_message(MessageId::SetProperty, &msg);
    }

    fn on_get_property(&mut self, payload: &[u8]) {
        if payload.len() < 3 {
            return;
        }
        let (index, raw_prop, params) = (payload[0], u16::from_le_bytes([payload[1], payload[2]]), &payload[3..]);
        let value = match (PropertyId::from_u16(raw_prop), self.device.core(index)) {
            (Some(prop), Some(core)) => core
                .get_property(prop, params)
                .map_err(|e| debug!(index, ?prop, error = %e, "Property read rejected"))
                .ok(),
            _ => None,
        };
        let mut msg = vec![];
        encode_all!(&mut msg, index, raw_prop, u8::from(value.is_some()));
        msg.extend_from_slice(params);
        msg.extend(value.unwrap_or_default());
        self.sink.send_message(MessageId::GetProperty, &msg);
    }

    /// Start streaming measurements, does nothing if a run is active
    pub fn start_run(&mut self) {
        if self.run.running {
            return;
        }
        let Some(dma) = self.device.dma() else {
            warn!("No DMA engine, can't start a run");
            return;
        };
        dma.start_transfer();
        if self.sink.client_available() {
            self.sink.send_message(MessageId::RunStart, &[]);
        }
        self.run.running = true;
        info!("Run started");
    }

    /// Stop the active run: drain the DMA FIFO, reset the timer and report overflow counts. A FIFO
    /// that doesn't drain in time doesn't stop the rest of the teardown.
    /// # Errors
    /// Returns an error if the DMA FIFO didn't drain
    pub fn stop_run(&mut self) -> Result<()> {
        if !self.run.running {
            return Ok(());
        }
        let mut outcome = Ok(());

        if let Some(timer) = self.device.timer() {
            timer.set_running(false);
        }
        if let Some(dma) = self.device.dma() {
            dma.flush_fifo();
        }
        let start = Instant::now();
        loop {
            thread::sleep(self.timing.flush_poll());
            self.check_interrupt();
            if self.device.dma().map_or(true, |d| d.is_fifo_empty()) {
                break;
            }
            if start.elapsed() > self.timing.flush_timeout() {
                let timeout = self.timing.flush_timeout();
                warn!(?timeout, "DMA FIFO didn't drain");
                outcome = Err(Error::Unresponsive {
                    what: "DMA FIFO",
                    timeout,
                });
                break;
            }
        }
        if let Some(dma) = self.device.dma() {
            dma.stop_transfer();
            if self.device.wait_for_interrupt(Duration::ZERO) {
                self.device.clear_interrupts(dma.active_interrupts());
            }
        }

        let settle = self.timing.timer_settle();
        if let Some(timer) = self.device.timer_mut() {
            let max = timer.maximum_time();
            timer.set_reset(true);
            thread::sleep(settle);
            timer.set_reset(false);
            timer.set_maximum_time(max);
        }

        if self.sink.client_available() {
            for core in self.device.cores() {
                if let Ok(value) = core.get_property(PropertyId::OverflowCount, &[]) {
                    #[allow(clippy::cast_possible_truncation)]
                    let index = core.index() as u8;
                    let mut msg = vec![];
                    encode_all!(&mut msg, index, PropertyId::OverflowCount as u16, 1u8);
                    msg.extend(value);
                    self.sink.send_message(MessageId::GetProperty, &msg);
                }
            }
            self.sink.send_message(MessageId::RunStop, &[]);
        }

        self.run.running = false;
        info!("Run stopped");
        outcome
    }

    /// Relay new DMA data if the interrupt fired. Returns whether it did.
    pub fn check_interrupt(&mut self) -> bool {
        if !self.device.wait_for_interrupt(Duration::ZERO) {
            return false;
        }
        self.drain_dma();
        true
    }

    /// Relay the data the DMA engine wrote since the last call and clear its interrupts. Called
    /// once the interrupt line has fired.
    pub fn drain_dma(&mut self) {
        let (Some(dma), Some(buffer)) = (self.device.dma(), self.device.dma_buffer()) else {
            return;
        };
        let size = buffer.size();
        let msg_end = usize::try_from(dma.last_message_end())
            .unwrap_or(size)
            .min(size);
        let irq = dma.active_interrupts();
        let last = self.run.last_dma_idx;

        if self.sink.client_available() {
            // The engine wrapped without a memory end interrupt in between
            let end = if msg_end >= last { msg_end } else { size };
            self.sink.send_bytes(&self.run.pending);
            self.sink.send_bytes(&buffer.read(last, end));
        }

        self.run.pending.clear();
        self.run.last_dma_idx = msg_end;
        if irq & IRQ_MEM_END != 0 {
            self.run.last_dma_idx = 0;
            if msg_end != size {
                self.run.pending = buffer.read(msg_end, size);
            }
        }
        self.device.clear_interrupts(irq);
    }

    /// Stop the run once the timer reaches its limit
    /// # Errors
    /// Returns an error if the run had to be stopped and didn't stop cleanly
    pub fn poll_timer(&mut self) -> Result<()> {
        if !self.run.running || self.device.dma().is_none() {
            return Ok(());
        }
        let expired = self
            .device
            .timer()
            .is_some_and(|t| t.current_time() >= t.maximum_time());
        if expired {
            debug!("Time limit reached");
            return self.stop_run();
        }
        Ok(())
    }
}
