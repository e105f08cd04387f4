//! Reserved exception codes
//!
//! These are the exception codes the virtual machine itself raises.
//! They must stay in sync with the constants declared in the
//! `pkl-rt.pk` bootstrap source, which exposes them to user code.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Exception codes reserved by the virtual machine.
///
/// User code may raise exceptions with any code; only these are
/// raised by the machine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ExceptionCode {
    Generic = 0,
    DivByZero = 1,
    NoIos = 2,
    NoReturn = 3,
    OutOfBounds = 4,
    MapBounds = 5,
    Eof = 6,
    NoMap = 7,
    Conv = 8,
    Elem = 9,
    Constraint = 10,
    Io = 11,
    Signal = 12,
    IoFlags = 13,
    Inval = 14,
}

impl ExceptionCode {
    /// The default message carried by exceptions of this code.
    pub fn message(self) -> &'static str {
        match self {
            ExceptionCode::Generic => "generic",
            ExceptionCode::DivByZero => "division by zero",
            ExceptionCode::NoIos => "no IOS",
            ExceptionCode::NoReturn => "no return",
            ExceptionCode::OutOfBounds => "out of bounds",
            ExceptionCode::MapBounds => "out of map bounds",
            ExceptionCode::Eof => "EOF",
            ExceptionCode::NoMap => "no map",
            ExceptionCode::Conv => "conversion error",
            ExceptionCode::Elem => "invalid element",
            ExceptionCode::Constraint => "constraint violation",
            ExceptionCode::Io => "generic IO",
            ExceptionCode::Signal => "",
            ExceptionCode::IoFlags => "invalid IO flags",
            ExceptionCode::Inval => "invalid argument",
        }
    }

    /// The identifier under which `pkl-rt.pk` exposes this code.
    pub fn name(self) -> &'static str {
        match self {
            ExceptionCode::Generic => "E_generic",
            ExceptionCode::DivByZero => "E_div_by_zero",
            ExceptionCode::NoIos => "E_no_ios",
            ExceptionCode::NoReturn => "E_no_return",
            ExceptionCode::OutOfBounds => "E_out_of_bounds",
            ExceptionCode::MapBounds => "E_map_bounds",
            ExceptionCode::Eof => "E_eof",
            ExceptionCode::NoMap => "E_map",
            ExceptionCode::Conv => "E_conv",
            ExceptionCode::Elem => "E_elem",
            ExceptionCode::Constraint => "E_constraint",
            ExceptionCode::Io => "E_io",
            ExceptionCode::Signal => "E_signal",
            ExceptionCode::IoFlags => "E_io_flags",
            ExceptionCode::Inval => "E_inval",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_integers() {
        for code in 0..=14 {
            let e = ExceptionCode::try_from(code).unwrap();
            assert_eq!(i32::from(e), code);
        }
        assert!(ExceptionCode::try_from(15).is_err());
    }

    #[test]
    fn div_by_zero_is_code_one() {
        assert_eq!(i32::from(ExceptionCode::DivByZero), 1);
        assert_eq!(ExceptionCode::DivByZero.message(), "division by zero");
    }
}
