//! Built-in stage types
//!
//! Each submodule exposes `definitions()`, which [`Registry`](crate::registry::Registry)
//! uses to populate itself.

pub mod dsort;
pub mod io;
pub mod ring;
pub mod sort;

use crate::stage::StageLogic;

pub(crate) fn boxed<L: StageLogic + 'static>(logic: L) -> Box<dyn StageLogic> {
    Box::new(logic)
}
