//! Namespace-mode tap: kernel tuntap device
//!
//! The device is opened inside the peer namespace (the caller runs this
//! through the namespace-entry helper, sharing the fd table), configured as
//! IFF_TAP | IFF_NO_PI: raw Ethernet frames, no prefix.

use crate::event::claim_fd;
use crate::{Error, Result};
use std::os::unix::io::RawFd;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfreqFlags {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Open /dev/net/tun and attach to `ifname` as a tap device.
/// Must run in the namespace the device should live in.
pub fn tun_open(ifname: &str) -> Result<RawFd> {
    if ifname.len() >= libc::IFNAMSIZ {
        return Err(Error::Config(format!("interface name too long: {ifname}")));
    }

    let path = std::ffi::CString::new("/dev/net/tun").unwrap();
    let fd = claim_fd(unsafe {
        libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC)
    })?;

    let mut ifr = IfreqFlags {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: IFF_TAP | IFF_NO_PI,
        _pad: [0; 22],
    };
    ifr.ifr_name[..ifname.len()].copy_from_slice(ifname.as_bytes());

    if unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr) } < 0 {
        let e = Error::last_os();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}
