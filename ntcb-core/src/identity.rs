//! Snowflake identity generator.
//!
//! Every process instance gets one 64-bit, time-ordered identifier at
//! startup. The layout follows the classic snowflake scheme:
//!
//! ```text
//!  63        22 21      12 11        0
//! ┌────────────┬──────────┬───────────┐
//! │ ms - epoch │ node id  │ sequence  │
//! │  41 bits   │ 10 bits  │  12 bits  │
//! └────────────┴──────────┴───────────┘
//! ```
//!
//! Uniqueness across the fleet relies on operators assigning distinct node
//! ids. Within a process, [`generate`] shares one generator per node id, so
//! repeated calls never hand out the same value.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch in milliseconds (2010-11-04T01:42:54.657Z).
pub const EPOCH_MS: i64 = 1_288_834_974_657;

pub const NODE_BITS: u8 = 10;
pub const STEP_BITS: u8 = 12;
pub const MAX_NODE_ID: i64 = (1 << NODE_BITS) - 1;

const STEP_MASK: i64 = (1 << STEP_BITS) - 1;
const TIME_SHIFT: u8 = NODE_BITS + STEP_BITS;
const NODE_SHIFT: u8 = STEP_BITS;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid node id {0}: must be within 0..={MAX_NODE_ID}")]
    InvalidNodeId(i64),
}

/// Per-process snowflake generator.
///
/// Not internally synchronised: callers sharing one generator between tasks
/// must serialise access themselves (e.g. behind a mutex).
#[derive(Debug)]
pub struct SnowflakeGenerator {
    node: i64,
    last_ms: i64,
    step: i64,
}

impl SnowflakeGenerator {
    pub fn new(node: i64) -> Result<Self, IdentityError> {
        if !(0..=MAX_NODE_ID).contains(&node) {
            return Err(IdentityError::InvalidNodeId(node));
        }
        Ok(Self { node, last_ms: 0, step: 0 })
    }

    pub fn node(&self) -> i64 {
        self.node
    }

    /// Produces the next identifier.
    pub fn next_id(&mut self) -> i64 {
        let mut now = current_millis().max(self.last_ms);

        if now == self.last_ms {
            self.step = (self.step + 1) & STEP_MASK;
            if self.step == 0 {
                // sequence exhausted for this millisecond
                while now <= self.last_ms {
                    std::hint::spin_loop();
                    now = current_millis().max(self.last_ms);
                }
            }
        } else {
            self.step = 0;
        }
        self.last_ms = now;

        ((now - EPOCH_MS) << TIME_SHIFT) | (self.node << NODE_SHIFT) | self.step
    }
}

static GENERATORS: Mutex<BTreeMap<i64, SnowflakeGenerator>> = Mutex::new(BTreeMap::new());

/// Next identifier from the process-wide generator of `node`.
pub fn generate(node: i64) -> Result<i64, IdentityError> {
    let mut generators = GENERATORS.lock();
    if let Some(generator) = generators.get_mut(&node) {
        return Ok(generator.next_id());
    }
    let mut generator = SnowflakeGenerator::new(node)?;
    let id = generator.next_id();
    generators.insert(node, generator);
    Ok(id)
}

/// Splits an identifier back into `(millis since unix epoch, node, step)`.
pub fn decompose(id: i64) -> (i64, i64, i64) {
    let millis = (id >> TIME_SHIFT) + EPOCH_MS;
    let node = (id >> NODE_SHIFT) & MAX_NODE_ID;
    let step = id & STEP_MASK;
    (millis, node, step)
}

fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(EPOCH_MS)
}
