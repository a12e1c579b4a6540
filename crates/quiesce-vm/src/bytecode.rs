/// Opcode of the stack machine.
///
/// Every opcode occupies one unit of code address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Does nothing.
    Nop,

    /// Pushes a constant.
    Const(i64),

    /// Pops `b` then `a`, pushes `a + b` (wrapping).
    Add,

    /// Pops `b` then `a`, pushes `a - b` (wrapping).
    Sub,

    /// Pushes the value of a local.
    LocalGet(u32),

    /// Pops a value into a local.
    LocalSet(u32),

    /// Pops a value.
    Drop,

    /// Jumps to an opcode of the current function.
    Br(u32),

    /// Pops a value, jumps to an opcode of the current function if non-zero.
    BrIf(u32),

    /// Calls a function, passing it arguments popped from the stack.
    Call(u32),

    /// Pops a value, and returns it to the caller.
    Return,
}
