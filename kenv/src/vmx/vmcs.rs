//! Virtual-Machine Control State (VMCS) related apis.
use crate::error::VmError;
use abyss::{
    addressing::{Gpa, Pa, Va},
    x86_64::Cr0,
    HardwareContext, VmxFailure,
};
use iced_x86::{Decoder, DecoderOptions, Instruction};
use num_enum::TryFromPrimitive;

/// Possible errors for vm-related instructions.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 30-1. Vm-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, TryFromPrimitive)]
#[repr(u64)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation
    VmcallInVmxRoot = 1,
    /// VMCLEAR with invalid physical address
    VmclearWithInvAddr = 2,
    /// VMCLEAR with VMXON pointer
    VmclearWithVmxon = 3,
    /// VMLAUNCH with non-clear VMCS
    VmlaunchWithNonclearVmcs = 4,
    /// VMRESUME with non-launched VMCS
    VmresumeWithNonlaunchedVmcs = 5,
    /// VMRESUME after VMXOFF
    VmresumeAfterVmxoff = 6,
    /// VM entry with invalid control field(s)
    InvalidCs = 7,
    /// VM entry with invalid host-state field(s)
    InvalidHostState = 8,
    /// VMPTRLD with invalid physical address
    VmPtrLdWithInvAddr = 9,
    /// VMPTRLD with VMXON pointer
    VmPtrLdWithVmxOn = 10,
    /// VMPTRLD with incorrect VMCS revision identifier
    VmPtrLdWithIncorrectRevId = 11,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField = 12,
    /// VMWRITE to read-only VMCS component
    WriteToRoField = 13,
    /// VMXON executed in VMX root operation
    VmxonInVmxRoot = 15,
    /// VM entry with events blocked by MOV SS.
    VmentryWithEventBlockedByMovss = 26,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidOperandToInveptInvvpid = 28,
    /// No current VMCS, or an error number this kernel does not know.
    Unknown = 0xffff,
}

/// Vmcs field.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    // 16bit fields
    GuestCsSelector = 0x00000802,
    // 64bit fields
    IoBitmapA = 0x00002000,
    IoBitmapB = 0x00002002,
    VmexitMsrStoreAddr = 0x00002006,
    VmexitMsrLoadAddr = 0x00002008,
    VmentryMsrLoadAddr = 0x0000200A,
    Eptptr = 0x0000201A,
    GuestPhysicalAddr = 0x00002400,
    GuestLinkPointer = 0x00002800,
    GuestIa32Efer = 0x00002806,
    // 32bit fields
    PinBasedExecControls = 0x00004000,
    ProcessorBasedVmexecControls = 0x00004002,
    VmexitControls = 0x0000400C,
    VmexitMsrStoreCount = 0x0000400E,
    VmexitMsrLoadCount = 0x00004010,
    VmentryControls = 0x00004012,
    VmentryMsrLoadCount = 0x00004014,
    VmentryInterruptionInfo = 0x00004016,
    SecondaryVmexecControls = 0x0000401E,
    InstructionError = 0x00004400,
    VmexitReason = 0x00004402,
    VmexitInterruptionInfo = 0x00004404,
    VmexitInstructionLength = 0x0000440C,
    GuestCsLimit = 0x00004802,
    GuestCsAccessRights = 0x00004816,
    // natural-width fields
    VmexitQualification = 0x00006400,
    GuestCr0 = 0x00006800,
    GuestCr4 = 0x00006804,
    GuestCsBase = 0x00006808,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
}

/// Possible list of basic vmexit reasons.
///
/// See Table C-1. Basic Exit Reasons for details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0x0,
    ExternalInt = 0x1,
    TripleFault = 0x2,
    InitSignal = 0x3,
    StartupIpi = 0x4,
    IoSmi = 0x5,
    OtherSmi = 0x6,
    InterruptWindow = 0x7,
    NmiWindow = 0x8,
    TaskSwitch = 0x9,
    Cpuid = 0xA,
    Getsec = 0xB,
    Hlt = 0xC,
    Invd = 0xD,
    Invlpg = 0xE,
    Rdpmc = 0xF,
    Rdtsc = 0x10,
    Rsm = 0x11,
    Vmcall = 0x12,
    Vmclear = 0x13,
    Vmlaunch = 0x14,
    Vmptrld = 0x15,
    Vmptrst = 0x16,
    Vmread = 0x17,
    Vmresume = 0x18,
    Vmwrite = 0x19,
    Vmxoff = 0x1A,
    Vmxon = 0x1B,
    MovCr = 0x1C,
    MovDr = 0x1D,
    IoInstruction = 0x1E,
    Rdmsr = 0x1F,
    Wrmsr = 0x20,
    EntfailGuestState = 0x21,
    EntfailMsrLoading = 0x22,
    Mwait = 0x24,
    Mtf = 0x25,
    Monitor = 0x27,
    Pause = 0x28,
    EntfailMachineChk = 0x29,
    TprBelowThreshold = 0x2B,
    ApicAccess = 0x2C,
    AccessGdtrOrIdtr = 0x2E,
    AccessLdtrOrTr = 0x2F,
    EptViolation = 0x30,
    EptMisconfig = 0x31,
    Invept = 0x32,
    Rdtscp = 0x33,
    VmxPreemptTimer = 0x34,
    Invvpid = 0x35,
    Wbinvd = 0x36,
    Xsetbv = 0x37,
}

/// Enumeration of vmexit reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exit during the run.
    BasicExitReason(BasicExitReason),
    /// Failed on vmlaunch or vmresume.
    EntryFailure(BasicExitReason),
}

impl ExitReason {
    /// get basic exit reason of the exit reason.
    pub fn get_basic_reason(&self) -> BasicExitReason {
        match self {
            Self::BasicExitReason(e) | Self::EntryFailure(e) => *e,
        }
    }
}

/// Translation from guest-physical to host-virtual addresses, used to
/// fetch guest memory from the host.
pub trait Probe {
    /// Translate guest physical address to host virtual address
    fn gpa2hva(&self, gpa: Gpa) -> Option<Va>;
}

/// The control structure currently loaded on this processor.
pub struct ActiveVmcs<'a> {
    hw: &'a dyn HardwareContext,
}

impl<'a> ActiveVmcs<'a> {
    /// Make the control structure at `vmcs` current.
    pub fn activate(hw: &'a dyn HardwareContext, vmcs: Pa) -> Result<Self, VmError> {
        hw.vmptrld(vmcs)
            .map_err(|e| VmError::VmxOperationError(Self::instruction_error(hw, e)))?;
        Ok(Self { hw })
    }

    /// The structure the processor left current on the last exit.
    pub fn current(hw: &'a dyn HardwareContext) -> Self {
        Self { hw }
    }

    fn instruction_error(hw: &dyn HardwareContext, e: VmxFailure) -> InstructionError {
        match e {
            VmxFailure::Invalid => InstructionError::Unknown,
            VmxFailure::Valid => hw
                .vmread(Field::InstructionError as u32)
                .ok()
                .and_then(|v| InstructionError::try_from(v).ok())
                .unwrap_or(InstructionError::Unknown),
        }
    }

    /// Write to the vmcs field of the activated vmcs.
    pub fn write(&self, field: Field, v: u64) -> Result<(), VmError> {
        self.hw
            .vmwrite(field as u32, v)
            .map_err(|e| VmError::VmxOperationError(Self::instruction_error(self.hw, e)))
    }

    /// Read from the vmcs field of the activated vmcs.
    pub fn read(&self, field: Field) -> Result<u64, VmError> {
        self.hw
            .vmread(field as u32)
            .map_err(|e| VmError::VmxOperationError(Self::instruction_error(self.hw, e)))
    }

    /// Read-modify-write a field.
    pub fn update(&self, field: Field, f: impl FnOnce(u64) -> u64) -> Result<(), VmError> {
        self.write(field, f(self.read(field)?))
    }

    /// Resolve the exit reason of the activated vmcs.
    pub fn exit_reason(&self) -> Result<ExitReason, VmError> {
        let reason = self.read(Field::VmexitReason)?;
        let basic = BasicExitReason::try_from((reason & 0xffff) as u16)
            .map_err(|_| VmError::UnknownExitReason(reason as u16))?;
        if reason & 0x8000_0000 != 0 {
            Ok(ExitReason::EntryFailure(basic))
        } else {
            Ok(ExitReason::BasicExitReason(basic))
        }
    }

    /// Length of the instruction that caused the exit.
    pub fn instruction_length(&self) -> Result<usize, VmError> {
        self.read(Field::VmexitInstructionLength).map(|v| v as usize)
    }

    /// Get the instruction that rip pointed.
    ///
    /// Only works while the guest runs unpaged, where a linear address is
    /// a guest-physical address.
    pub fn get_instruction<P: Probe + ?Sized>(&self, p: &P) -> Result<Instruction, VmError> {
        let cr0 = Cr0::from_bits_truncate(self.read(Field::GuestCr0)?);
        if cr0.contains(Cr0::PG) {
            return Err(VmError::FailedToDecodeInstruction);
        }
        let bitness = if cr0.contains(Cr0::PE) { 32 } else { 16 };
        let linear = self.read(Field::GuestCsBase)? + self.read(Field::GuestRip)?;
        let len = self.instruction_length()?.clamp(1, 15);
        // Every intel instruction is at most 15 bytes.
        let mut bytes = [0u8; 15];
        for (i, byte) in bytes[..len].iter_mut().enumerate() {
            let hva = Gpa::new(linear as usize + i)
                .and_then(|gpa| p.gpa2hva(gpa))
                .ok_or(VmError::FailedToDecodeInstruction)?;
            // SAFETY: the probe only hands out addresses of mapped guest frames.
            *byte = unsafe { *hva.as_ptr::<u8>() };
        }

        let mut decoder = Decoder::with_ip(bitness, &bytes[..len], linear, DecoderOptions::NONE);
        let mut insn = Instruction::default();
        if decoder.can_decode() {
            decoder.decode_out(&mut insn);
            Ok(insn)
        } else {
            Err(VmError::FailedToDecodeInstruction)
        }
    }
}

bitflags::bitflags! {
    /// Exit Qualification for EPT Violations
    ///
    /// See Intel Manual volume 3C. Table 28-7. Exit Qualification for EPT Violations
    pub struct EptViolationQualification: u64 {
        /// The access was a data read.
        const READ = 1 << 0;
        /// The access was a data write.
        const WRITE = 1 << 1;
        /// The access was an instruction fetch.
        const FETCH = 1 << 2;
        /// The guest-physical address was readable.
        const READABLE = 1 << 3;
        /// The guest-physical address was writeable.
        const WRITEABLE = 1 << 4;
        /// The guest-physical address was executable.
        const EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const LINEAR_VALID = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Exit qualification for I/O instructions.
    ///
    /// See Intel Manual volume 3C. Table 28-5.
    pub struct IoQualification: u64 {
        /// Access size minus one, bits 2:0.
        const SIZE_MASK = 0b111;
        /// Direction: set for IN.
        const IN = 1 << 3;
        /// String instruction.
        const STRING = 1 << 4;
        /// REP prefixed.
        const REP = 1 << 5;
        /// Operand encoding: set for an immediate port.
        const IMMEDIATE = 1 << 6;
        /// Port number, bits 31:16.
        const PORT_MASK = 0xffff_0000;
    }
}

impl IoQualification {
    /// Port the instruction accessed.
    pub fn port(&self) -> u16 {
        ((self.bits() & Self::PORT_MASK.bits()) >> 16) as u16
    }

    /// Access width in bytes.
    pub fn size(&self) -> usize {
        (self.bits() & Self::SIZE_MASK.bits()) as usize + 1
    }
}
