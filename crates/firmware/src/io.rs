//! Port-mapped I/O.
//!
//! Drivers never issue `in`/`out` instructions themselves; they go through
//! [`PortIo`], which the bare-metal build implements with [`X86Ports`] and the
//! tests with a scripted fake.

/// Port written to waste a few cycles between slow device accesses.
pub const DELAY_PORT: u16 = 0x80;

/// Access to the x86 I/O port space.
pub trait PortIo {
    fn read_u8(&mut self, port: u16) -> u8;
    fn write_u8(&mut self, port: u16, value: u8);
    fn read_u16(&mut self, port: u16) -> u16;
    fn write_u16(&mut self, port: u16, value: u16);
    fn read_u32(&mut self, port: u16) -> u32;
    fn write_u32(&mut self, port: u16, value: u32);

    /// Waits roughly `rounds` microseconds by writing to [`DELAY_PORT`].
    fn io_delay(&mut self, rounds: u16) {
        for _ in 0..rounds {
            self.write_u8(DELAY_PORT, 0);
        }
    }
}

impl<P> PortIo for &mut P
where
    P: PortIo + ?Sized,
{
    fn read_u8(&mut self, port: u16) -> u8 {
        (**self).read_u8(port)
    }

    fn write_u8(&mut self, port: u16, value: u8) {
        (**self).write_u8(port, value);
    }

    fn read_u16(&mut self, port: u16) -> u16 {
        (**self).read_u16(port)
    }

    fn write_u16(&mut self, port: u16, value: u16) {
        (**self).write_u16(port, value);
    }

    fn read_u32(&mut self, port: u16) -> u32 {
        (**self).read_u32(port)
    }

    fn write_u32(&mut self, port: u16, value: u32) {
        (**self).write_u32(port, value);
    }

    fn io_delay(&mut self, rounds: u16) {
        (**self).io_delay(rounds);
    }
}

/// The real I/O port space of the executing CPU.
#[derive(Debug)]
pub struct X86Ports {
    _private: (),
}

impl X86Ports {
    /// # Safety
    ///
    /// The caller must be the only code driving the chipset through port I/O.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        use core::arch::asm;

        impl PortIo for X86Ports {
            fn read_u8(&mut self, port: u16) -> u8 {
                let value: u8;
                unsafe {
                    asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
                }
                value
            }

            fn write_u8(&mut self, port: u16, value: u8) {
                unsafe {
                    asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
                }
            }

            fn read_u16(&mut self, port: u16) -> u16 {
                let value: u16;
                unsafe {
                    asm!("in ax, dx", out("ax") value, in("dx") port, options(nomem, nostack, preserves_flags));
                }
                value
            }

            fn write_u16(&mut self, port: u16, value: u16) {
                unsafe {
                    asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags));
                }
            }

            fn read_u32(&mut self, port: u16) -> u32 {
                let value: u32;
                unsafe {
                    asm!("in eax, dx", out("eax") value, in("dx") port, options(nomem, nostack, preserves_flags));
                }
                value
            }

            fn write_u32(&mut self, port: u16, value: u32) {
                unsafe {
                    asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags));
                }
            }
        }
    } else {
        impl PortIo for X86Ports {
            fn read_u8(&mut self, _port: u16) -> u8 {
                unimplemented!("unsupported architecture")
            }

            fn write_u8(&mut self, _port: u16, _value: u8) {
                unimplemented!("unsupported architecture")
            }

            fn read_u16(&mut self, _port: u16) -> u16 {
                unimplemented!("unsupported architecture")
            }

            fn write_u16(&mut self, _port: u16, _value: u16) {
                unimplemented!("unsupported architecture")
            }

            fn read_u32(&mut self, _port: u16) -> u32 {
                unimplemented!("unsupported architecture")
            }

            fn write_u32(&mut self, _port: u16, _value: u32) {
                unimplemented!("unsupported architecture")
            }
        }
    }
}
