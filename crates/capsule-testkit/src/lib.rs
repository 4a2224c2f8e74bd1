//! Test utilities for exercising capsule runtimes against an in-memory ledger.
//!
//! - `mock` module: ledger, funding, signer and code host doubles
//! - `fixtures` module: capsule definitions shared by the integration tests
//! - [`TestNetwork`]: builds runtimes that share one ledger and code registry

pub mod fixtures;
pub mod mock;

use std::sync::{Arc, Once};

use anyhow::Result;
use capsule_kernel::{Credential, KernelConfig, Runtime, RuntimeBuilder};

pub use mock::{MockCodeHost, MockFunding, MockLedger, MockSigner};

/// Route `log` output through env_logger once per test binary.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// One runtime plus the doubles it was built with.
pub struct TestRuntime {
    pub runtime: Runtime,
    pub funding: Arc<MockFunding>,
    pub signer: Arc<MockSigner>,
}

impl std::ops::Deref for TestRuntime {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        &self.runtime
    }
}

/// Shared ledger and code host; every runtime built here sees the same chain.
#[derive(Default)]
pub struct TestNetwork {
    pub ledger: Arc<MockLedger>,
    pub code_host: Arc<MockCodeHost>,
}

impl TestNetwork {
    pub fn new() -> Self {
        init_logging();
        Self::default()
    }

    pub fn config(owner: &str) -> KernelConfig {
        KernelConfig {
            app: "testkit".into(),
            owner: Credential::address(owner),
            auto_publish: false,
            ..KernelConfig::default()
        }
    }

    /// Runtime whose signer holds `owner`'s key and publishes on `sync`.
    pub fn runtime(&self, owner: &str) -> Result<TestRuntime> {
        self.runtime_with(Self::config(owner), None)
    }

    pub fn runtime_with(
        &self,
        config: KernelConfig,
        states: Option<capsule_store::DynStateStore>,
    ) -> Result<TestRuntime> {
        let funding = Arc::new(MockFunding::new(
            self.ledger.clone(),
            Credential::address("funder"),
        ));
        let signer = Arc::new(MockSigner::new([config.owner.clone()]));
        let mut builder = RuntimeBuilder::new(self.ledger.clone(), self.code_host.clone())
            .with_config(config)
            .with_funding(funding.clone())
            .with_authorization(signer.clone());
        if let Some(states) = states {
            builder = builder.with_state_store(states);
        }
        Ok(TestRuntime {
            runtime: builder.build()?,
            funding,
            signer,
        })
    }
}
