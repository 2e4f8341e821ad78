//! Buzz core library
//!
//! The pieces shared by the compiler and the runtime: the value model and
//! heap, the string interner, the instruction set, the wire codec, and
//! the debug-symbol file format.

pub mod bytecode;
pub mod debug;
pub mod heap;
pub mod msg;
pub mod strings;
pub mod value;

pub use bytecode::{ArgKind, Opcode};
pub use debug::{DebugInfo, SourceLoc};
pub use heap::{Heap, ObjRef};
pub use msg::{ByteReader, CodecError, MessageType, MESSAGE_TYPE_COUNT};
pub use strings::StringInterner;
pub use value::{
    ActRec, Closure, ClosureRef, IStr, StringId, Table, TableKey, TypeTag, Value, values_cmp,
    values_eq,
};
