mod builtins;
mod error;
mod future;
mod heap;
mod isolate;
mod join;
mod mutex;
mod native;
mod object;
mod runtime;
mod value;
mod visitor;
mod vm;

pub use builtins::{SYNC_NATIVES, init_sync};
pub use error::*;
pub use future::*;
pub use heap::*;
pub use isolate::*;
pub use join::*;
pub use mutex::*;
pub use native::*;
pub use object::*;
pub use runtime::*;
pub use value::*;
pub use visitor::{RootProvider, Visitable, Visitor};
pub use vm::*;
