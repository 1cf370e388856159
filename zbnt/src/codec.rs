//! Little-endian encoding of the numbers carried in message payloads

/// Types that can be appended to a message payload
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);
}

/// Types that can be read from a message payload
pub trait Decode: Sized {
    /// Number of payload bytes consumed
    const SIZE: usize;
    /// Read a value at `offset`, `None` if `data` is too short
    fn decode(data: &[u8], offset: usize) -> Option<Self>;
}

macro_rules! enc_num {
    ($num:ty) => {
        impl Encode for $num {
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

macro_rules! dec_num {
    ($num:ty) => {
        impl Decode for $num {
            const SIZE: usize = core::mem::size_of::<$num>();
            fn decode(data: &[u8], offset: usize) -> Option<Self> {
                let bytes = data.get(offset..offset.checked_add(Self::SIZE)?)?;
                Some(<$num>::from_le_bytes(bytes.try_into().ok()?))
            }
        }
    };
}

enc_num!(u8);
enc_num!(u16);
enc_num!(u32);
enc_num!(u64);

dec_num!(u8);
dec_num!(u16);
dec_num!(u32);
dec_num!(u64);

impl Encode for [u8] {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl Encode for str {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

/// Append every argument to `out`, in order
#[macro_export]
macro_rules! encode_all {
    ($out:expr, $($v:expr),+ $(,)?) => {{
        $( $crate::codec::Encode::encode(&$v, $out); )+
    }};
}

/// Append a string with a `u16` length prefix
#[allow(clippy::cast_possible_truncation)]
pub fn encode_str(out: &mut Vec<u8>, s: &str) {
    (s.len() as u16).encode(out);
    s.encode(out);
}
