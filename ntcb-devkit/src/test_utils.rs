/*!
Test harness for NTCB components

Builds a [`ComponentContext`] wired to a [`MockBus`] so dispatchers and
schedulers can be exercised without a broker or an authority.
*/

use crate::mock_bus::MockBus;
use ntcb_core::config::ComponentConfig;
use ntcb_core::header::ComponentHeader;
use ntcb_core::lifecycle::{ComponentContext, Fleet};
use ntcb_core::messages::ComponentKind;
use std::sync::Arc;
use std::time::Duration;

pub const TEST_SECRET: &str = "secret1";

pub struct TestHarness {
    pub bus: Arc<MockBus>,
    pub ctx: ComponentContext,
}

impl TestHarness {
    pub fn new(kind: ComponentKind, component_id: &str) -> Self {
        let mut cfg = ComponentConfig::default();
        cfg.server_id = 2;
        cfg.ntcb.component_id = component_id.to_string();
        cfg.ntcb.access_key = TEST_SECRET.to_string();
        Self::from_config(kind, &cfg)
    }

    /// Context whose snowID is forced to `snow_id`.
    pub fn with_snow_id(kind: ComponentKind, component_id: &str, snow_id: i64) -> Self {
        let mut harness = Self::new(kind, component_id);
        let mut header = (*harness.ctx.header).clone();
        header.snow_id = snow_id;
        harness.ctx = ComponentContext::new(header, kind, harness.bus.clone());
        harness
    }

    pub fn from_config(kind: ComponentKind, cfg: &ComponentConfig) -> Self {
        let header = match ComponentHeader::build(cfg) {
            Ok(h) => h,
            Err(e) => panic!("test config produced an invalid header: {e}"),
        };
        let bus = MockBus::shared();
        let ctx = ComponentContext::new(header, kind, bus.clone());
        Self { bus, ctx }
    }

    pub fn snow_id(&self) -> i64 {
        self.ctx.snow_id()
    }

    /// A [`Fleet`] over the mock, with no drain window.
    pub fn fleet(&self) -> Fleet {
        Fleet::new(self.ctx.clone(), self.bus.clone(), Duration::ZERO)
    }
}
