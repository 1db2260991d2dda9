pub mod asm;
pub mod bytecode;
pub mod closure;
pub mod env;
pub mod error;
pub mod host;
pub mod interpreter;
pub mod object;
pub mod value;

pub use asm::{assemble, AsmError, Assembler};
pub use bytecode::{disassemble, CodeBuffer, ConstantPool, DecodeError, Opcode, PoolError, PushItem};
pub use closure::Closure;
pub use env::{Environment, LocalScope, WithStack};
pub use error::{VmError, VmResult};
pub use host::stage::Stage;
pub use host::{DisplayTree, HostBridge, HostRequest, LogHost, Session, VmConfig};
pub use interpreter::{call_value, construct, execute, Activation, Completion, OperandStack};
pub use object::{NativeCall, NativeFunction, ObjectRef, PlainObject, ScriptObject};
pub use value::Value;
