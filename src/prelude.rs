//! Shared imports for std and no_std builds. Everything the stack allocates
//! comes from `alloc`, so the same re-exports serve both configurations.

#![allow(unused_imports)]

pub use alloc::boxed::Box;
pub use alloc::collections::VecDeque;
pub use alloc::format;
pub use alloc::rc::Rc;
pub use alloc::string::{String, ToString};
pub use alloc::vec;
pub use alloc::vec::Vec;
pub use core::cell::RefCell;
pub use core::fmt::Debug;
