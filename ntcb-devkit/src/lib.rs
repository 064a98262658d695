/*!
# NTCB DevKit - test doubles for component development

- Mock bus recording every publish, no broker needed
- Harness building a component context around the mock
*/

pub mod mock_bus;
pub mod test_utils;

pub use mock_bus::{MockBus, MockMessage};
pub use test_utils::{TestHarness, TEST_SECRET};
