//! A session shared between the thread serving the client and a worker relaying DMA interrupts

use crate::{
    backend::{
        Backend,
        InterruptSource,
    },
    error::Result,
    messages::{
        MessageId,
        MessageSink,
    },
    session::Session,
};
use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::Instant,
};
use tracing::{
    debug,
    error,
    warn,
};

#[derive(Debug)]
struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct Server<B, S>
where
    B: Backend + 'static,
    S: MessageSink + Send + 'static,
{
    session: Arc<Mutex<Session<B, S>>>,
    worker: Option<Worker>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl<B, S> Server<B, S>
where
    B: Backend + 'static,
    S: MessageSink + Send + 'static,
{
    /// Serve `session`, starting the interrupt worker
    #[must_use]
    pub fn new(session: Session<B, S>) -> Self {
        let mut server = Self {
            session: Arc::new(Mutex::new(session)),
            worker: None,
        };
        server.start_worker();
        server
    }

    /// Exclusive access to the session, the worker waits while this is held
    #[must_use]
    pub(crate) fn session(&self) -> MutexGuard<'_, Session<B, S>> {
        lock(&self.session)
    }

    /// Look at the session without being able to reload it behind the worker's back
    pub fn inspect<R>(&self, f: impl FnOnce(&Session<B, S>) -> R) -> R {
        f(&self.session())
    }

    pub fn client_connected(&self) {
        self.session().client_connected();
    }

    pub fn client_disconnected(&self) {
        self.session().client_disconnected();
    }

    pub fn handle_message(&mut self, id: u16, payload: &[u8]) {
        if id == MessageId::ProgramPl as u16 {
            // The interrupt line changes with the bitstream
            self.stop_worker();
            self.session().handle_message(id, payload);
            self.start_worker();
        } else {
            self.session().handle_message(id, payload);
        }
    }

    /// Load `name` with the worker paused
    /// # Errors
    /// Returns an error if the bitstream fails to load
    pub fn program_pl(&mut self, name: &str) -> Result<()> {
        self.stop_worker();
        let res = self.session().program_pl(name);
        self.start_worker();
        res
    }

    fn start_worker(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let irq = self.session().device().interrupt();
        let handle = {
            let session = self.session.clone();
            let stop = stop.clone();
            thread::spawn(move || run_worker(&session, irq, &stop))
        };
        self.worker = Some(Worker { stop, handle });
    }

    fn stop_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::SeqCst);
        if worker.handle.join().is_err() {
            error!("Interrupt worker panicked");
        }
    }
}

impl<B, S> Drop for Server<B, S>
where
    B: Backend + 'static,
    S: MessageSink + Send + 'static,
{
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn run_worker<B, S>(
    session: &Mutex<Session<B, S>>,
    irq: Option<Arc<dyn InterruptSource>>,
    stop: &AtomicBool,
) where
    B: Backend,
    S: MessageSink,
{
    let timing = lock(session).timing().clone();
    let mut last_check = Instant::now();
    debug!(interrupt = irq.is_some(), "Interrupt worker started");

    while !stop.load(Ordering::SeqCst) {
        match &irq {
            Some(irq) => match irq.wait(timing.interrupt_wait()) {
                Ok(true) => lock(session).drain_dma(),
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to wait for the DMA interrupt");
                    thread::sleep(timing.interrupt_wait());
                }
            },
            None => thread::sleep(timing.interrupt_wait()),
        }

        if last_check.elapsed() >= timing.watchdog_interval() {
            last_check = Instant::now();
            if let Err(e) = lock(session).poll_timer() {
                error!(error = %e, "Failed to stop the run at its time limit");
            }
        }
    }
    debug!("Interrupt worker stopped");
}
