// runtime.rs — Single fusion task on a worker thread
//
// The engine is moved onto one worker thread and only ever touched there.
// Hosts talk to it through a bounded, ordered command queue; poses come back
// on a bounded output queue. Samples are dropped (QueueFull) rather than
// blocking a sensor callback; control commands block until queued.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{FusionError, FusionResult};
use crate::map_match::VectorMap;
use crate::sensor_fusion::{FusionEngine, FusionEvent};
use crate::types::{InitialPose, MotionMode, Pose, SensorSample};

enum Command {
    Sample(SensorSample),
    Tick(u64),
    Reset(Option<InitialPose>),
    SetMode(Option<MotionMode>),
    SetVectorMap(VectorMap),
    Shutdown,
}

/// What the worker publishes after each command that produces output
#[derive(Clone, Debug)]
pub enum TaskOutput {
    Pose { pose: Pose, events: Vec<FusionEvent> },
    Error(FusionError),
}

#[derive(Clone, Copy, Debug)]
pub struct TaskConfig {
    pub command_capacity: usize,
    pub output_capacity: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            command_capacity: 1024,
            output_capacity: 256,
        }
    }
}

pub struct FusionTask;

impl FusionTask {
    /// Move `engine` onto a worker thread and return the host handle.
    pub fn spawn(engine: FusionEngine, config: TaskConfig) -> FusionHandle {
        let (command_tx, command_rx) = channel::bounded(config.command_capacity.max(1));
        let (output_tx, output_rx) = channel::bounded(config.output_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let worker_stop = Arc::clone(&stop);
        let worker = thread::spawn(move || run_worker(engine, command_rx, output_tx, worker_stop));

        FusionHandle {
            commands: command_tx,
            outputs: output_rx,
            stop,
            worker: Some(worker),
        }
    }
}

fn run_worker(
    mut engine: FusionEngine,
    commands: Receiver<Command>,
    outputs: Sender<TaskOutput>,
    stop: Arc<AtomicBool>,
) -> FusionEngine {
    let mut published = 0u64;

    while let Ok(command) = commands.recv() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let output = match command {
            Command::Sample(sample) => engine.push_sample(sample).err().map(TaskOutput::Error),
            Command::Tick(t) => Some(match engine.tick(t) {
                Ok(pose) => TaskOutput::Pose { pose, events: engine.take_events() },
                Err(e) => TaskOutput::Error(e),
            }),
            Command::Reset(initial) => {
                engine.reset(initial);
                None
            }
            Command::SetMode(mode) => {
                engine.set_mode(mode);
                None
            }
            Command::SetVectorMap(map) => engine.set_vector_map(map).err().map(TaskOutput::Error),
            Command::Shutdown => break,
        };

        if let Some(output) = output {
            match outputs.try_send(output) {
                Ok(_) => {
                    published += 1;
                    if published % 500 == 0 {
                        log::debug!("[fusion] {} outputs published", published);
                    }
                }
                Err(TrySendError::Full(_)) => {
                    // Host is not draining, drop this output
                    log::warn!("[fusion] output queue full, dropping");
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::info!("[fusion] output receiver gone after {} outputs", published);
                    break;
                }
            }
        }
    }

    log::info!("[fusion] worker stopped");
    engine
}

/// Host side of a running fusion task
pub struct FusionHandle {
    commands: Sender<Command>,
    outputs: Receiver<TaskOutput>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<FusionEngine>>,
}

impl FusionHandle {
    /// Non-blocking; a full queue drops the sample.
    pub fn push_sample(&self, sample: SensorSample) -> FusionResult<()> {
        match self.commands.try_send(Command::Sample(sample)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(FusionError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(FusionError::Disconnected),
        }
    }

    pub fn tick(&self, timestamp_ns: u64) -> FusionResult<()> {
        self.send(Command::Tick(timestamp_ns))
    }

    pub fn reset(&self, initial: Option<InitialPose>) -> FusionResult<()> {
        self.send(Command::Reset(initial))
    }

    pub fn set_mode(&self, mode: Option<MotionMode>) -> FusionResult<()> {
        self.send(Command::SetMode(mode))
    }

    pub fn set_vector_map(&self, map: VectorMap) -> FusionResult<()> {
        self.send(Command::SetVectorMap(map))
    }

    /// Poses and errors, in command order
    pub fn outputs(&self) -> &Receiver<TaskOutput> {
        &self.outputs
    }

    fn send(&self, command: Command) -> FusionResult<()> {
        self.commands.send(command).map_err(|_| FusionError::Disconnected)
    }

    /// Ask the worker to stop before its next command; queued work is
    /// discarded. Follow with `shutdown` to collect the engine.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Finish the commands already queued, stop the worker and hand the
    /// engine back.
    pub fn shutdown(mut self) -> FusionResult<FusionEngine> {
        // The worker may already be gone after request_stop
        if self.commands.send(Command::Shutdown).is_err() {
            log::debug!("[fusion] worker already stopped");
        }
        let worker = self.worker.take().ok_or(FusionError::Disconnected)?;
        worker
            .join()
            .map_err(|_| FusionError::EngineCorrupt("fusion worker panicked".into()))
    }
}
