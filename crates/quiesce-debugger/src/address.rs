use std::fmt;

/// Address of an opcode within loaded guest code.
///
/// The upper 32 bits hold the ID of the instance owning the code, the lower
/// 32 bits the offset of the opcode within that instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    /// Creates an address from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Creates an address from an instance ID and a code offset.
    pub const fn from_parts(instance_id: u32, offset: u32) -> Self {
        Self(((instance_id as u64) << 32) | offset as u64)
    }

    /// Returns the ID of the instance owning the code at this address.
    pub const fn instance_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the code offset within the owning instance.
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    /// Returns the raw value of this address.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of a function within the function space of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionSpaceIndex(pub u32);

impl fmt::Display for FunctionSpaceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Trait implemented by the module loader, resolving functions of a loaded
/// instance to code addresses.
pub trait CodeInstance {
    /// Returns the ID of this instance.
    fn instance_id(&self) -> u32;

    /// Returns the address of the first opcode of the given function.
    fn entry_address(&self, function: FunctionSpaceIndex) -> Option<VirtualAddress>;
}

#[cfg(test)]
mod tests {
    use super::VirtualAddress;

    #[test]
    fn parts() {
        let addr = VirtualAddress::from_parts(3, 0x42);

        assert_eq!(addr.instance_id(), 3);
        assert_eq!(addr.offset(), 0x42);
        assert_eq!(addr.as_u64(), 0x3_0000_0042);
        assert_eq!(addr.to_string(), "0x300000042");
    }
}
