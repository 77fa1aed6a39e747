//! Per-architecture machine constants

use serde::{Deserialize, Serialize};
use std::fmt;

/// Code generation target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X64,
    Arm64,
}

impl Arch {
    /// The architecture this process runs on (x64 tables for anything that
    /// is not aarch64)
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else {
            Arch::X64
        }
    }

    pub fn constants(self) -> &'static MachineConstants {
        match self {
            Arch::X64 => &X64,
            Arch::Arm64 => &ARM64,
        }
    }
}

impl Default for Arch {
    fn default() -> Self {
        Arch::host()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X64 => write!(f, "x64"),
            Arch::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Element type of a SIMD lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimdType {
    Int32x4,
    Float32x4,
    Float64x2,
}

impl SimdType {
    pub fn lanes(self) -> u32 {
        match self {
            SimdType::Int32x4 | SimdType::Float32x4 => 4,
            SimdType::Float64x2 => 2,
        }
    }
}

/// Register file and layout rules of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConstants {
    pub arch: Arch,
    pub pointer_size: u32,
    pub stack_alignment: u32,
    pub code_alignment: u32,
    /// Longest single encoded instruction
    pub max_instruction_size: u32,
    /// General registers available to the allocator
    pub allocatable_gprs: u8,
    /// Float registers available to the allocator
    pub allocatable_fprs: u8,
    pub simd_register_bytes: u32,
    /// Bytes of one pdata (function table) entry
    pub pdata_entry_size: u32,
    /// Bytes of unwind (xdata) header
    pub xdata_header_size: u32,
}

/// rsp and rbp are reserved; r11 is the scratch register
pub static X64: MachineConstants = MachineConstants {
    arch: Arch::X64,
    pointer_size: 8,
    stack_alignment: 16,
    code_alignment: 16,
    max_instruction_size: 255,
    allocatable_gprs: 13,
    allocatable_fprs: 16,
    simd_register_bytes: 16,
    pdata_entry_size: 12,
    xdata_header_size: 8,
};

/// sp, fp, lr, the platform register and two scratch registers are reserved
pub static ARM64: MachineConstants = MachineConstants {
    arch: Arch::Arm64,
    pointer_size: 8,
    stack_alignment: 16,
    code_alignment: 4,
    max_instruction_size: 255,
    allocatable_gprs: 25,
    allocatable_fprs: 32,
    simd_register_bytes: 16,
    pdata_entry_size: 8,
    xdata_header_size: 4,
};

impl MachineConstants {
    /// Bytes of a frame holding `slots` pointer-sized values, rounded up to
    /// the stack alignment
    pub fn frame_bytes(&self, slots: u32) -> u32 {
        let raw = slots * self.pointer_size;
        raw.div_ceil(self.stack_alignment) * self.stack_alignment
    }

    /// Pointer-sized slots in an aligned frame of `slots` values
    pub fn aligned_slots(&self, slots: u32) -> u32 {
        self.frame_bytes(slots) / self.pointer_size
    }

    /// Register class and lane count a SIMD type maps to
    pub fn simd_mapping(&self, ty: SimdType) -> (RegisterClass, u32) {
        debug_assert_eq!(self.simd_register_bytes, 16);
        (RegisterClass::Float, ty.lanes())
    }

    pub fn align_code(&self, size: u32) -> u32 {
        size.div_ceil(self.code_alignment) * self.code_alignment
    }
}

/// Register class of a virtual register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterClass {
    General,
    Float,
}
