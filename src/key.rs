use std::hash::Hasher;

use siphasher::sip::SipHasher24;

/// Types that can be used as keys of a [`HashMap`](crate::HashMap).
///
/// A key must be equality-comparable and must produce a 64-bit hash keyed by
/// the map's two secret subkeys. The subkeys are generated from the operating
/// system's CSPRNG when the map is created, so hash values differ between
/// maps; this is the usual mitigation against hash-flooding.
///
/// Implementations are provided for the fixed-width integers, `usize`/
/// `isize`, byte slices, and strings. Integer kinds of the same numeric value
/// hash differently across signedness and width, and a `str` hashes
/// differently from the equal byte slice, so a map keyed by an enum of mixed
/// kinds will not see accidental cross-kind collisions.
///
/// Custom key types opt in by implementing `sum64` themselves. A type that
/// already knows its own 64-bit hash may ignore the subkeys and return that
/// hash verbatim:
///
/// ```
/// use lockfree::Key;
///
/// #[derive(PartialEq, Eq)]
/// struct DeviceId(u64);
///
/// impl Key for DeviceId {
///     fn sum64(&self, _k0: u64, _k1: u64) -> u64 {
///         self.0.rotate_left(17) ^ 0x9e37_79b9_7f4a_7c15
///     }
/// }
/// ```
///
/// The hash and `Eq` must agree: keys that compare equal must return equal
/// hashes for the same subkey pair.
pub trait Key: Eq {
    /// Returns the 64-bit hash of this key under the subkey pair `(k0, k1)`.
    fn sum64(&self, k0: u64, k1: u64) -> u64;
}

/// SipHash-2-4 of `bytes` under the 128-bit key `(k0, k1)`.
fn sip24(k0: u64, k1: u64, bytes: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(k0, k1);
    hasher.write(bytes);
    hasher.finish()
}

// The subkey perturbations keep kinds apart: signed and unsigned views of
// the same bits must not collide, and neither must text and the equal bytes.
macro_rules! sip_key {
    ($($t:ty => |$k1:ident| $adjust:expr;)*) => {
        $(
            impl Key for $t {
                fn sum64(&self, k0: u64, $k1: u64) -> u64 {
                    sip24(k0, $adjust, &self.to_le_bytes())
                }
            }
        )*
    };
}

sip_key! {
    u8    => |k1| k1;
    u16   => |k1| k1;
    u32   => |k1| k1;
    i8    => |k1| k1.wrapping_sub(1);
    i16   => |k1| k1.wrapping_sub(1);
    i32   => |k1| k1.wrapping_sub(1);
    i64   => |k1| k1;
    usize => |k1| k1.wrapping_add(1);
    isize => |k1| k1.wrapping_add(2);
}

impl Key for u64 {
    /// Identity: a `u64` key is its own hash. This keeps the common
    /// integer-keyed map cheap; callers that need collision resistance
    /// against adversarial `u64` keys should wrap the key in a newtype with
    /// a keyed `sum64`.
    fn sum64(&self, _k0: u64, _k1: u64) -> u64 {
        *self
    }
}

impl Key for [u8] {
    fn sum64(&self, k0: u64, k1: u64) -> u64 {
        sip24(k0, k1, self)
    }
}

impl Key for str {
    fn sum64(&self, k0: u64, k1: u64) -> u64 {
        sip24(k0, k1.wrapping_sub(1), self.as_bytes())
    }
}

impl Key for String {
    fn sum64(&self, k0: u64, k1: u64) -> u64 {
        self.as_str().sum64(k0, k1)
    }
}

impl Key for Vec<u8> {
    fn sum64(&self, k0: u64, k1: u64) -> u64 {
        self.as_slice().sum64(k0, k1)
    }
}

impl<T: Key + ?Sized> Key for &T {
    fn sum64(&self, k0: u64, k1: u64) -> u64 {
        (**self).sum64(k0, k1)
    }
}
