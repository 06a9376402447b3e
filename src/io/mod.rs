// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Reversible I/O: interception windows, per-LP certified windows and the
//! global commit order.

pub mod buffer;
pub mod coordinator;
pub mod heap;
pub mod queue;

pub use buffer::{EventWindows, IoOp, IoOpKind, IoTarget, MemorySink, ReverseRecord, SeekStore, WindowLimit};
pub use coordinator::ReversibleIo;
pub use heap::{HeapOrder, IoHeap, KeyedQueue};
pub use queue::{Consumer, NbQueue, Producer};
