// SPDX-License-Identifier: GPL-3.0-only

//! Serialized render command queue
//!
//! One dedicated thread owns the render backend. Commands are processed in
//! submission order; each carries a completion that the render thread invokes
//! with the result. If the thread is gone, the command is dropped together
//! with its completion, which async callers observe as
//! [`RenderError::QueueClosed`].

use super::registry::{BindingRegistry, RenderedFrame, SetupOutcome, SetupRequest};
use super::{BindingId, HeadlessBackend, HeadlessOptions, RenderBackend, TextureHandle, TextureId};
use crate::backends::camera::{FramePlanes, Resolution};
use crate::constants::{LOG_EVERY_N_FRAMES, render_event};
use crate::errors::RenderError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Continuation run on the render thread with a command's result
pub type Completion<T> = Box<dyn FnOnce(T) + Send>;

/// Creates the backend on the render thread
pub type BackendFactory =
    Box<dyn FnOnce() -> Result<Box<dyn RenderBackend>, RenderError> + Send>;

/// Work for the render thread
pub enum RenderCommand {
    Setup {
        request: SetupRequest,
        done: Completion<Result<SetupOutcome, RenderError>>,
    },
    Register {
        binding: BindingId,
        done: Completion<Result<(), RenderError>>,
    },
    Render {
        binding: BindingId,
        done: Completion<Result<Option<RenderedFrame>, RenderError>>,
    },
    /// Completes with `false` if the binding was already released
    Cleanup {
        binding: BindingId,
        done: Completion<bool>,
    },
    CreateOutput {
        size: Resolution,
        done: Completion<Result<TextureId, RenderError>>,
    },
    /// The staging planes travel with the command and come back with the
    /// result so their buffers can be reused
    Convert {
        output: TextureId,
        planes: FramePlanes,
        done: Completion<(FramePlanes, Result<TextureHandle, RenderError>)>,
    },
    DestroyOutput {
        texture: TextureId,
        done: Completion<()>,
    },
    Shutdown,
}

impl RenderCommand {
    /// Render event id used in logs
    pub fn event_id(&self) -> i32 {
        match self {
            RenderCommand::Setup { .. } | RenderCommand::CreateOutput { .. } => render_event::SETUP,
            RenderCommand::Cleanup { .. }
            | RenderCommand::DestroyOutput { .. }
            | RenderCommand::Shutdown => render_event::CLEANUP,
            RenderCommand::Render { .. } => render_event::RENDER,
            RenderCommand::Convert { .. } => render_event::CONVERT,
            RenderCommand::Register { .. } => render_event::REGISTER,
        }
    }
}

impl std::fmt::Debug for RenderCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderCommand::Setup { request, .. } => write!(f, "Setup({})", request.session),
            RenderCommand::Register { binding, .. } => write!(f, "Register({})", binding),
            RenderCommand::Render { binding, .. } => write!(f, "Render({})", binding),
            RenderCommand::Cleanup { binding, .. } => write!(f, "Cleanup({})", binding),
            RenderCommand::CreateOutput { size, .. } => write!(f, "CreateOutput({})", size),
            RenderCommand::Convert { output, .. } => write!(f, "Convert({})", output),
            RenderCommand::DestroyOutput { texture, .. } => write!(f, "DestroyOutput({})", texture),
            RenderCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}

struct QueueInner {
    sender: Mutex<Option<mpsc::Sender<RenderCommand>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    backend_name: &'static str,
    processed: Arc<AtomicU64>,
}

impl QueueInner {
    fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(RenderCommand::Shutdown);
        }

        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            // The last handle may be dropped from a completion on the render thread
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if let Err(e) = thread.join() {
                error!("Render thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to the render thread
#[derive(Clone)]
pub struct RenderQueue {
    inner: Arc<QueueInner>,
}

impl RenderQueue {
    /// Spawn the render thread and create the backend on it.
    ///
    /// Fails if the backend cannot be created.
    pub fn start(factory: BackendFactory) -> Result<Self, RenderError> {
        let (sender, receiver) = mpsc::channel();
        let (init_tx, init_rx) = mpsc::sync_channel(1);
        let processed = Arc::new(AtomicU64::new(0));
        let thread_processed = Arc::clone(&processed);

        let thread = std::thread::Builder::new()
            .name("render-thread".to_string())
            .spawn(move || render_thread_main(factory, receiver, init_tx, thread_processed))
            .map_err(|e| RenderError::BackendUnavailable(format!("spawn render thread: {}", e)))?;

        let backend_name = match init_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(RenderError::BackendUnavailable(
                    "render thread died during startup".to_string(),
                ));
            }
        };

        info!(backend = backend_name, "Render thread started");

        Ok(Self {
            inner: Arc::new(QueueInner {
                sender: Mutex::new(Some(sender)),
                thread: Mutex::new(Some(thread)),
                backend_name,
                processed,
            }),
        })
    }

    /// Render thread backed by the CPU renderer
    pub fn headless(options: HeadlessOptions) -> Result<Self, RenderError> {
        Self::start(Box::new(move || {
            Ok(Box::new(HeadlessBackend::new(options)) as Box<dyn RenderBackend>)
        }))
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend_name
    }

    /// Commands processed so far
    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Enqueue a command. On failure the command, and its completion, is
    /// dropped unrun.
    pub fn submit(&self, command: RenderCommand) -> Result<(), RenderError> {
        let guard = self.inner.sender.lock().unwrap_or_else(|e| e.into_inner());
        let sender = guard.as_ref().ok_or(RenderError::QueueClosed)?;
        sender.send(command).map_err(|_| RenderError::QueueClosed)
    }

    async fn call<T: Send + 'static>(
        &self,
        make: impl FnOnce(Completion<T>) -> RenderCommand,
    ) -> Result<T, RenderError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(make(Box::new(move |value| {
            let _ = tx.send(value);
        })))?;
        rx.await.map_err(|_| RenderError::QueueClosed)
    }

    pub async fn setup(&self, request: SetupRequest) -> Result<SetupOutcome, RenderError> {
        self.call(|done| RenderCommand::Setup { request, done })
            .await?
    }

    pub async fn register(&self, binding: BindingId) -> Result<(), RenderError> {
        self.call(|done| RenderCommand::Register { binding, done })
            .await?
    }

    pub async fn cleanup(&self, binding: BindingId) -> Result<bool, RenderError> {
        self.call(|done| RenderCommand::Cleanup { binding, done }).await
    }

    pub async fn create_output(&self, size: Resolution) -> Result<TextureId, RenderError> {
        self.call(|done| RenderCommand::CreateOutput { size, done })
            .await?
    }

    pub async fn destroy_output(&self, texture: TextureId) -> Result<(), RenderError> {
        self.call(|done| RenderCommand::DestroyOutput { texture, done })
            .await
    }

    /// Queue a render of the binding's newest image
    pub fn render(
        &self,
        binding: BindingId,
        done: Completion<Result<Option<RenderedFrame>, RenderError>>,
    ) -> Result<(), RenderError> {
        self.submit(RenderCommand::Render { binding, done })
    }

    /// Queue a YUV conversion of `planes` into `output`
    pub fn convert(
        &self,
        output: TextureId,
        planes: FramePlanes,
        done: Completion<(FramePlanes, Result<TextureHandle, RenderError>)>,
    ) -> Result<(), RenderError> {
        self.submit(RenderCommand::Convert {
            output,
            planes,
            done,
        })
    }

    /// Stop the render thread after the commands already queued.
    ///
    /// Resources still held by bindings are released on the way out.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for RenderQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderQueue")
            .field("backend", &self.inner.backend_name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn render_thread_main(
    factory: BackendFactory,
    receiver: mpsc::Receiver<RenderCommand>,
    init_tx: mpsc::SyncSender<Result<&'static str, RenderError>>,
    processed: Arc<AtomicU64>,
) {
    let mut backend = match factory() {
        Ok(backend) => backend,
        Err(e) => {
            warn!(error = %e, "Render backend creation failed");
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    let _ = init_tx.send(Ok(backend.name()));
    drop(init_tx);

    let mut registry = BindingRegistry::new();

    while let Ok(command) = receiver.recv() {
        let event = command.event_id();
        let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
        if count % LOG_EVERY_N_FRAMES == 0 {
            debug!(event, count, ?command, "Render command");
        }

        let backend = backend.as_mut();
        match command {
            RenderCommand::Setup { request, done } => {
                let result = registry.setup(backend, request);
                if let Err(e) = &result {
                    warn!(event, session = %request.session, error = %e, "Binding setup failed");
                }
                done(result);
            }
            RenderCommand::Register { binding, done } => {
                done(registry.register(backend, binding));
            }
            RenderCommand::Render { binding, done } => {
                done(registry.render(backend, binding));
            }
            RenderCommand::Cleanup { binding, done } => {
                done(registry.cleanup(backend, binding));
            }
            RenderCommand::CreateOutput { size, done } => {
                done(registry.create_output(backend, size));
            }
            RenderCommand::Convert {
                output,
                planes,
                done,
            } => {
                let result = registry.convert(backend, output, &planes);
                done((planes, result));
            }
            RenderCommand::DestroyOutput { texture, done } => {
                registry.destroy_output(backend, texture);
                done(());
            }
            RenderCommand::Shutdown => break,
        }
    }

    registry.clear(backend.as_mut());
    info!(
        processed = processed.load(Ordering::Relaxed),
        "Render thread stopped"
    );
}
