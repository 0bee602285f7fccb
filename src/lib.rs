pub mod prelude {
    pub use super::common::prelude::*;
    pub use super::sched::prelude::*;
    pub use super::channel::prelude::*;
    pub use super::trace::prelude::*;
}

pub mod common;
pub mod sched;
pub mod channel;
pub mod trace;
pub mod sim;
