//! Fatal error path.
//!
//! When the firmware panics it dumps the CPU registers and the top of the
//! stack to the console and halts the processor. Capturing registers needs
//! ring 0 on bare-metal x86-64; elsewhere the dump shows zeroes.

use core::fmt;

/// Number of 64-bit words dumped from the top of the stack.
pub const STACK_WORDS: usize = 16;

const REGISTERS_PER_LINE: usize = 4;
const WORDS_PER_LINE: usize = 4;

/// Register contents at the time of a panic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub cs: u64,
    pub es: u64,
    pub ds: u64,
    pub ss: u64,
    pub cr3: u64,
    pub cr4: u64,
}

impl CpuState {
    /// Registers in the order they are dumped.
    #[must_use]
    pub fn registers(&self) -> [(&'static str, u64); 22] {
        [
            ("rax", self.rax),
            ("rbx", self.rbx),
            ("rcx", self.rcx),
            ("rdx", self.rdx),
            ("rsi", self.rsi),
            ("rdi", self.rdi),
            ("rbp", self.rbp),
            ("rsp", self.rsp),
            ("r8", self.r8),
            ("r9", self.r9),
            ("r10", self.r10),
            ("r11", self.r11),
            ("r12", self.r12),
            ("r13", self.r13),
            ("r14", self.r14),
            ("r15", self.r15),
            ("cs", self.cs),
            ("es", self.es),
            ("ds", self.ds),
            ("ss", self.ss),
            ("cr3", self.cr3),
            ("cr4", self.cr4),
        ]
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        use core::{arch::asm, ptr};

        macro_rules! read_register {
            ($name:literal) => {{
                let value: u64;
                unsafe {
                    asm!(
                        concat!("mov {}, ", $name),
                        out(reg) value,
                        options(nomem, nostack, preserves_flags),
                    );
                }
                value
            }};
        }

        macro_rules! read_segment {
            ($name:literal) => {{
                let value: u16;
                unsafe {
                    asm!(
                        concat!("mov {:x}, ", $name),
                        out(reg) value,
                        options(nomem, nostack, preserves_flags),
                    );
                }
                u64::from(value)
            }};
        }

        impl CpuState {
            /// Reads the registers of the executing CPU.
            ///
            /// The general purpose registers reflect the state inside this
            /// function, not the faulting instruction.
            #[must_use]
            pub fn capture() -> Self {
                Self {
                    rax: read_register!("rax"),
                    rbx: read_register!("rbx"),
                    rcx: read_register!("rcx"),
                    rdx: read_register!("rdx"),
                    rsi: read_register!("rsi"),
                    rdi: read_register!("rdi"),
                    rbp: read_register!("rbp"),
                    rsp: read_register!("rsp"),
                    r8: read_register!("r8"),
                    r9: read_register!("r9"),
                    r10: read_register!("r10"),
                    r11: read_register!("r11"),
                    r12: read_register!("r12"),
                    r13: read_register!("r13"),
                    r14: read_register!("r14"),
                    r15: read_register!("r15"),
                    cs: read_segment!("cs"),
                    es: read_segment!("es"),
                    ds: read_segment!("ds"),
                    ss: read_segment!("ss"),
                    cr3: read_register!("cr3"),
                    cr4: read_register!("cr4"),
                }
            }
        }

        /// Reads [`STACK_WORDS`] words upwards from `state.rsp`.
        #[expect(clippy::cast_possible_truncation)]
        #[must_use]
        pub fn capture_stack(state: &CpuState) -> [u64; STACK_WORDS] {
            let mut words = [0; STACK_WORDS];
            let top = ptr::with_exposed_provenance::<u64>(state.rsp as usize);
            for (i, word) in words.iter_mut().enumerate() {
                // The stack pointer was just read from a live stack, which
                // holds at least the frames of the panic machinery.
                *word = unsafe { ptr::read_volatile(top.add(i)) };
            }
            words
        }
    } else {
        impl CpuState {
            #[must_use]
            pub fn capture() -> Self {
                Self::default()
            }
        }

        #[must_use]
        pub fn capture_stack(_state: &CpuState) -> [u64; STACK_WORDS] {
            [0; STACK_WORDS]
        }
    }
}

/// Writes the panic dump for `reason` to `w`.
pub fn write_panic_report<W>(
    w: &mut W,
    reason: impl fmt::Display,
    state: &CpuState,
    stack: &[u64; STACK_WORDS],
) -> fmt::Result
where
    W: fmt::Write,
{
    write!(w, "\n*** PANIC ***\nReason: {reason}\n")?;

    writeln!(w, "CPU State:")?;
    for line in state.registers().chunks(REGISTERS_PER_LINE) {
        w.write_char('\t')?;
        for (i, (name, value)) in line.iter().enumerate() {
            if i > 0 {
                w.write_str("  ")?;
            }
            write!(w, "{name:>3}={value:016x}")?;
        }
        writeln!(w)?;
    }

    writeln!(w, "STACK:")?;
    for line in stack.chunks(WORDS_PER_LINE) {
        w.write_char('\t')?;
        for (i, word) in line.iter().enumerate() {
            if i > 0 {
                w.write_char(' ')?;
            }
            write!(w, "{word:016x}")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

cfg_if::cfg_if! {
    if #[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), target_os = "none"))] {
        /// Stops the processor for good.
        pub fn halt() -> ! {
            unsafe {
                core::arch::asm!("cli", options(nomem, nostack));
            }
            loop {
                unsafe {
                    core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
                }
            }
        }
    } else {
        /// Stops the processor for good.
        pub fn halt() -> ! {
            loop {
                core::hint::spin_loop();
            }
        }
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use crate::console::{self, SinkWriter};

    let state = CpuState::capture();
    let stack = capture_stack(&state);
    console::mark_panicked();

    // Nothing runs after this handler but `halt`.
    if let Some(sink) = unsafe { console::panic_sink() } {
        let mut writer = SinkWriter(sink);
        let _ = match info.location() {
            Some(location) => write_panic_report(
                &mut writer,
                format_args!("{} (at {location})", info.message()),
                &state,
                &stack,
            ),
            None => write_panic_report(&mut writer, info.message(), &state, &stack),
        };
    }
    halt()
}
