use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// A 32-bit IPv4 address with the increment/next semantics the allocator
/// needs on top of `std::net::Ipv4Addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpAddr32(u32);

impl IpAddr32 {
    pub const UNSPECIFIED: IpAddr32 = IpAddr32(0);

    pub fn parse(s: &str) -> Option<IpAddr32> {
        let mut octets = [0u8; 4];
        let mut parts = s.split('.');
        for octet in octets.iter_mut() {
            let part = parts.next()?;
            *octet = part.parse::<u16>().ok().filter(|v| *v <= 255)? as u8;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(IpAddr32::from(Ipv4Addr::from(octets)))
    }

    /// Increment in place, wrapping at 0xFFFFFFFF back to zero.
    pub fn inc(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Return the next address without mutating `self`.
    pub fn next(&self) -> IpAddr32 {
        let mut copy = *self;
        copy.inc();
        copy
    }

    pub fn is_unspecified(&self) -> bool {
        self.0 == 0
    }

    pub fn to_u32(self) -> u32 {
        self.0
    }
}

impl From<Ipv4Addr> for IpAddr32 {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddr32(u32::from(addr))
    }
}

impl From<IpAddr32> for Ipv4Addr {
    fn from(addr: IpAddr32) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl From<u32> for IpAddr32 {
    fn from(v: u32) -> Self {
        IpAddr32(v)
    }
}

impl FromStr for IpAddr32 {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpAddr32::parse(s).ok_or(())
    }
}

impl fmt::Display for IpAddr32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ipv4Addr::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for s in ["0.0.0.0", "255.255.255.255", "10.1.1.1", "192.168.10.100"] {
            let parsed = IpAddr32::parse(s).unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn rejects_bad_octets() {
        assert!(IpAddr32::parse("256.1.1.1").is_none());
        assert!(IpAddr32::parse("1.2.3").is_none());
        assert!(IpAddr32::parse("1.2.3.4.5").is_none());
        assert!(IpAddr32::parse("a.b.c.d").is_none());
    }

    #[test]
    fn increment_wraps_octets() {
        let mut ip = IpAddr32::parse("1.2.3.254").unwrap();
        ip.inc();
        assert_eq!(ip.to_string(), "1.2.3.255");
        ip.inc();
        assert_eq!(ip.to_string(), "1.2.4.0");
        assert_eq!(ip.next().to_string(), "1.2.4.1");
        // next() must not mutate the receiver
        assert_eq!(ip.to_string(), "1.2.4.0");
    }

    #[test]
    fn increment_wraps_at_max() {
        let mut ip = IpAddr32::from(0xFFFF_FFFFu32);
        ip.inc();
        assert_eq!(ip.to_u32(), 0);
    }
}
