//! Outbound argument conversion: every command argument is
//! rendered to its wire bytes *before* the encoder ever sees it, so the
//! encoder itself only ever deals with `Vec<u8>` tokens.

use crate::error::{RedisError, RedisResult};
use crate::value::ScoreBound;

/// Converts a single Rust value into the bytes that should appear inside
/// the command's blob-string argument slot.
pub trait ToArg {
    fn to_arg(&self) -> RedisResult<Vec<u8>>;
}

macro_rules! impl_to_arg_int {
    ($($t:ty),*) => {
        $(impl ToArg for $t {
            fn to_arg(&self) -> RedisResult<Vec<u8>> {
                let mut buf = itoa::Buffer::new();
                Ok(buf.format(*self).as_bytes().to_vec())
            }
        })*
    };
}
impl_to_arg_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl ToArg for f32 {
    fn to_arg(&self) -> RedisResult<Vec<u8>> {
        (*self as f64).to_arg()
    }
}

impl ToArg for f64 {
    fn to_arg(&self) -> RedisResult<Vec<u8>> {
        if self.is_infinite() {
            Ok(if *self > 0.0 { b"+inf".to_vec() } else { b"-inf".to_vec() })
        } else {
            let mut buf = ryu::Buffer::new();
            Ok(buf.format(*self).as_bytes().to_vec())
        }
    }
}

impl ToArg for bool {
    fn to_arg(&self) -> RedisResult<Vec<u8>> {
        Ok(if *self { b"true".to_vec() } else { b"false".to_vec() })
    }
}

impl ToArg for str {
    fn to_arg(&self) -> RedisResult<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> RedisResult<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> RedisResult<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> RedisResult<Vec<u8>> {
        Ok(self.clone())
    }
}

impl ToArg for ScoreBound {
    fn to_arg(&self) -> RedisResult<Vec<u8>> {
        Ok(self.to_arg_string().into_bytes())
    }
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> RedisResult<Vec<u8>> {
        (*self).to_arg()
    }
}

/// A value that expands into zero or more command tokens: scalars expand
/// to exactly one, `Option` to zero or one, slices/`Vec` to N. Optionals and
/// sequences are unwrapped by the caller-side wrappers before reaching the
/// encoder.
pub trait ToArgs {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) -> RedisResult<()>;
}

macro_rules! impl_to_args_scalar {
    ($($t:ty),*) => {
        $(impl ToArgs for $t {
            fn write_args(&self, out: &mut Vec<Vec<u8>>) -> RedisResult<()> {
                out.push(ToArg::to_arg(self)?);
                Ok(())
            }
        })*
    };
}
impl_to_args_scalar!(
    i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, bool, str, String, ScoreBound
);

impl<T: ToArgs + ?Sized> ToArgs for &T {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) -> RedisResult<()> {
        (*self).write_args(out)
    }
}

impl<T: ToArg> ToArgs for Option<T> {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) -> RedisResult<()> {
        if let Some(v) = self {
            out.push(v.to_arg()?);
        }
        Ok(())
    }
}

impl<T: ToArg> ToArgs for [T] {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) -> RedisResult<()> {
        for item in self {
            out.push(item.to_arg()?);
        }
        Ok(())
    }
}

impl<T: ToArg> ToArgs for Vec<T> {
    fn write_args(&self, out: &mut Vec<Vec<u8>>) -> RedisResult<()> {
        self.as_slice().write_args(out)
    }
}

/// Builds a full command token vector: the command name followed by every
/// argument's wire bytes, in order. Returns `InvalidType` without partial
/// output if any argument fails to convert.
pub fn build_command(name: &str, args: &[&dyn ToArg]) -> RedisResult<Vec<Vec<u8>>> {
    let mut tokens = Vec::with_capacity(args.len() + 1);
    tokens.push(name.as_bytes().to_vec());
    for arg in args {
        tokens.push(arg.to_arg().map_err(|_| {
            RedisError::InvalidType(format!("could not convert argument for `{name}`"))
        })?);
    }
    Ok(tokens)
}
