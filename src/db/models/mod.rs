#![allow(unused_imports)]

//! Domain records and their row shapes.
//! Everything is re-exported so `use crate::db::models::*;` reaches every type.

pub mod assignment;
pub mod content;
pub mod delivery;
pub mod event;
pub mod history;
pub mod lock;
pub mod planning;

pub use self::assignment::*;
pub use self::content::*;
pub use self::delivery::*;
pub use self::event::*;
pub use self::history::*;
pub use self::lock::*;
pub use self::planning::*;
