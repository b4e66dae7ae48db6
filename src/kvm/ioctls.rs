//! The one KVM ioctl the core actually issues: `KVM_CHECK_EXTENSION`. Number
//! computed the same way `vmm-sys-util`'s `ioctl_io_nr!` does, to stay
//! consistent with how the rest of the ecosystem derives KVM ioctl numbers.

use std::os::raw::c_uint;

const _IOC_NRSHIFT: c_uint = 0;
const _IOC_TYPESHIFT: c_uint = 8;
const _IOC_SIZESHIFT: c_uint = 16;
const _IOC_DIRSHIFT: c_uint = 30;
const _IOC_NONE: c_uint = 0;

macro_rules! ioctl_io_nr {
    ($name:ident, $ty:expr, $nr:expr) => {
        #[allow(non_snake_case)]
        pub fn $name() -> ::std::os::raw::c_ulong {
            ((_IOC_NONE << _IOC_DIRSHIFT)
                | ($ty << _IOC_TYPESHIFT)
                | ($nr << _IOC_NRSHIFT)
                | (0 << _IOC_SIZESHIFT)) as ::std::os::raw::c_ulong
        }
    };
}

const KVMIO: c_uint = 0xAE;

ioctl_io_nr!(KVM_CHECK_EXTENSION, KVMIO, 0x03);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_extension_number() {
        assert_eq!(KVM_CHECK_EXTENSION(), 0xAE03);
    }
}
