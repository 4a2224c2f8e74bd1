use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicUsize, Ordering},
};

use capsule_store::{DynStateStore, FsStateStore, MemStateStore};
use futures::future::{BoxFuture, Shared};
use log::debug;

use crate::{
    code::{CodeHost, Deployment},
    config::KernelConfig,
    control::CallOrigin,
    error::KernelError,
    gate::Gate,
    ids::{BatchSeq, CapsuleId, CodeId},
    kernel::{CapsuleView, Kernel},
    ledger::{Authorization, Funding, Ledger, PublishObserver},
    record::CompiledBatch,
    value::Value,
};

pub(crate) type DrainFuture = Shared<BoxFuture<'static, Result<(), KernelError>>>;

pub(crate) struct RuntimeInner {
    pub(crate) kernel: Mutex<Kernel>,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) funding: Arc<dyn Funding>,
    pub(crate) signer: Arc<dyn Authorization>,
    pub(crate) states: DynStateStore,
    pub(crate) observers: Vec<Arc<dyn PublishObserver>>,
    /// The publish loop currently running, shared by every waiter.
    pub(crate) drain: Mutex<Option<DrainFuture>>,
    /// Callers currently awaiting a publish outcome.
    pub(crate) waiters: AtomicUsize,
}

/// Handle to one capsule runtime. Clones share state.
///
/// Synchronous methods run capsule code and record actions; the async
/// methods talk to the ledger. The kernel lock is never held across an
/// await.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pending", &self.pending_batches())
            .finish()
    }
}

pub struct RuntimeBuilder {
    config: KernelConfig,
    ledger: Arc<dyn Ledger>,
    code_host: Arc<dyn CodeHost>,
    funding: Option<Arc<dyn Funding>>,
    signer: Option<Arc<dyn Authorization>>,
    states: Option<DynStateStore>,
    observers: Vec<Arc<dyn PublishObserver>>,
}

impl RuntimeBuilder {
    pub fn new(ledger: Arc<dyn Ledger>, code_host: Arc<dyn CodeHost>) -> Self {
        Self {
            config: KernelConfig::default(),
            ledger,
            code_host,
            funding: None,
            signer: None,
            states: None,
            observers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_funding(mut self, funding: Arc<dyn Funding>) -> Self {
        self.funding = Some(funding);
        self
    }

    pub fn with_authorization(mut self, signer: Arc<dyn Authorization>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_state_store(mut self, states: DynStateStore) -> Self {
        self.states = Some(states);
        self
    }

    pub fn with_fs_state_store(mut self, root: impl AsRef<std::path::Path>) -> Result<Self, KernelError> {
        self.states = Some(Arc::new(FsStateStore::open(root)?));
        Ok(self)
    }

    pub fn with_observer(mut self, observer: Arc<dyn PublishObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_auto_publish(mut self, enable: bool) -> Self {
        self.config.auto_publish = enable;
        self
    }

    pub fn build(self) -> Result<Runtime, KernelError> {
        let funding = self
            .funding
            .ok_or_else(|| KernelError::Invariant("runtime needs a funding source".into()))?;
        let signer = self
            .signer
            .ok_or_else(|| KernelError::Invariant("runtime needs an authorization source".into()))?;
        let states = self
            .states
            .unwrap_or_else(|| Arc::new(MemStateStore::new()));
        debug!(
            "runtime for app '{}' on {} (auto publish: {})",
            self.config.app, self.config.network, self.config.auto_publish
        );
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                kernel: Mutex::new(Kernel::new(self.config, self.code_host)),
                ledger: self.ledger,
                funding,
                signer,
                states,
                observers: self.observers,
                drain: Mutex::new(None),
                waiters: AtomicUsize::new(0),
            }),
        })
    }
}

/// Counts a caller awaiting a publish for as long as it is alive.
pub(crate) struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    pub(crate) fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Runtime {
    pub(crate) fn kernel(&self) -> MutexGuard<'_, Kernel> {
        self.inner
            .kernel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> KernelConfig {
        self.kernel().config().clone()
    }

    /// Run `op` against the kernel, then start publishing if a batch closed.
    fn mutate<T>(&self, op: impl FnOnce(&mut Kernel) -> Result<T, KernelError>) -> Result<T, KernelError> {
        let (result, queued, auto) = {
            let mut kernel = self.kernel();
            let result = op(&mut kernel);
            (result, !kernel.queue.is_empty(), kernel.config.auto_publish)
        };
        if queued && auto {
            self.kick();
        }
        result
    }

    pub fn deploy(&self, deployment: impl Into<Deployment>) -> Result<CodeId, KernelError> {
        let deployment = deployment.into();
        self.mutate(|k| k.deploy(deployment))
    }

    pub fn create(&self, code: CodeId, args: Vec<Value>) -> Result<CapsuleId, KernelError> {
        self.mutate(|k| k.create(code, args, None))
    }

    pub fn call(&self, target: CapsuleId, method: &str, args: Vec<Value>) -> Result<Value, KernelError> {
        self.mutate(|k| k.call(target, method, args, CallOrigin::External))
    }

    /// Call that must not change any state.
    pub fn query(&self, target: CapsuleId, method: &str, args: Vec<Value>) -> Result<Value, KernelError> {
        self.mutate(|k| k.call(target, method, args, CallOrigin::Internal))
    }

    pub fn auth(&self, target: CapsuleId) -> Result<(), KernelError> {
        self.call(target, "auth", Vec::new()).map(|_| ())
    }

    pub fn destroy(&self, target: CapsuleId) -> Result<(), KernelError> {
        self.call(target, "destroy", Vec::new()).map(|_| ())
    }

    /// Read a field from outside any method.
    pub fn get(&self, target: CapsuleId, field: &str) -> Result<Value, KernelError> {
        let mut kernel = self.kernel();
        let mut ctx = crate::gate::Ctx::new(&mut kernel);
        ctx.get(target, field)
    }

    /// Write a field from outside any method; always rejected by the gate.
    pub fn set(&self, target: CapsuleId, field: &str, value: Value) -> Result<(), KernelError> {
        let mut kernel = self.kernel();
        let mut ctx = crate::gate::Ctx::new(&mut kernel);
        ctx.set(target, field, value)
    }

    /// Open a scope; every action until the matching `end` lands in one batch.
    pub fn begin(&self) {
        self.kernel().begin();
    }

    pub fn end(&self) -> Result<Option<BatchSeq>, KernelError> {
        self.mutate(|k| k.end())
    }

    pub fn view(&self, id: CapsuleId) -> Result<CapsuleView, KernelError> {
        self.kernel().view(id)
    }

    pub fn pending_batches(&self) -> Vec<BatchSeq> {
        self.kernel().pending_batches()
    }

    pub fn compile_pending(&self, seq: BatchSeq) -> Result<CompiledBatch, KernelError> {
        self.kernel().compile_pending(seq)
    }

    pub fn compile_open(&self) -> Result<Option<CompiledBatch>, KernelError> {
        self.kernel().compile_open()
    }

    /// Start a background publish if a tokio runtime is available.
    fn kick(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let drain = self.start_drain();
        tokio::spawn(async move {
            let _ = drain.await;
        });
    }
}
