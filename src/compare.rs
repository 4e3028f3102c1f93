//! Comparator dispatch
//!
//! A comparator is bound once at plan time to a `(left type, right type,
//! operator)` cell and two field offsets, and thereafter evaluates raw
//! tuple pointers with a single indirect call: the widening promotion is
//! baked into the selected function, so compare time carries no
//! allocation and no type branching. Illegal cells are rejected when the
//! comparator is built.

use crate::error::{Error, Result};
use crate::schema::{ColumnSpec, ColumnType};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=` / `==`
    Equal,
    /// `<>` / `!=`
    NotEqual,
    /// `<`
    Less,
    /// `<=`
    LessEqual,
    /// `>`
    Greater,
    /// `>=`
    GreaterEqual,
}

impl CompareOp {
    /// Parses an operator string; accepts `< <= = == <> != >= >`.
    pub fn parse(op: &str) -> Result<Self> {
        match op {
            "<" => Ok(CompareOp::Less),
            "<=" => Ok(CompareOp::LessEqual),
            "=" | "==" => Ok(CompareOp::Equal),
            "<>" | "!=" => Ok(CompareOp::NotEqual),
            ">=" => Ok(CompareOp::GreaterEqual),
            ">" => Ok(CompareOp::Greater),
            other => Err(Error::UnknownComparison(
                format!("unknown comparison operator `{other}`").into(),
            )),
        }
    }
}

/// Raw comparison over two field pointers; `n` is the bounded width for
/// byte-string comparisons and unused elsewhere.
type RawCompareFn = unsafe fn(lhs: *const u8, rhs: *const u8, n: usize) -> bool;

macro_rules! raw_numeric_fns {
    ($lt:ty, $rt:ty, $promote:ty => $eq:ident, $ne:ident, $lt_fn:ident, $le:ident, $gt:ident, $ge:ident) => {
        raw_numeric_fns!(@one $lt, $rt, $promote, $eq, ==);
        raw_numeric_fns!(@one $lt, $rt, $promote, $ne, !=);
        raw_numeric_fns!(@one $lt, $rt, $promote, $lt_fn, <);
        raw_numeric_fns!(@one $lt, $rt, $promote, $le, <=);
        raw_numeric_fns!(@one $lt, $rt, $promote, $gt, >);
        raw_numeric_fns!(@one $lt, $rt, $promote, $ge, >=);
    };
    (@one $lt:ty, $rt:ty, $promote:ty, $name:ident, $op:tt) => {
        unsafe fn $name(lhs: *const u8, rhs: *const u8, _n: usize) -> bool {
            // SAFETY: the dispatcher only selects this function for
            // fields of the matching fixed widths.
            let l = unsafe { lhs.cast::<$lt>().read_unaligned() } as $promote;
            let r = unsafe { rhs.cast::<$rt>().read_unaligned() } as $promote;
            l $op r
        }
    };
}

raw_numeric_fns!(i32, i32, i32 => int_int_eq, int_int_ne, int_int_lt, int_int_le, int_int_gt, int_int_ge);
raw_numeric_fns!(i32, i64, i64 => int_long_eq, int_long_ne, int_long_lt, int_long_le, int_long_gt, int_long_ge);
raw_numeric_fns!(i32, f64, f64 => int_dbl_eq, int_dbl_ne, int_dbl_lt, int_dbl_le, int_dbl_gt, int_dbl_ge);
raw_numeric_fns!(i64, i32, i64 => long_int_eq, long_int_ne, long_int_lt, long_int_le, long_int_gt, long_int_ge);
raw_numeric_fns!(i64, i64, i64 => long_long_eq, long_long_ne, long_long_lt, long_long_le, long_long_gt, long_long_ge);
raw_numeric_fns!(i64, f64, f64 => long_dbl_eq, long_dbl_ne, long_dbl_lt, long_dbl_le, long_dbl_gt, long_dbl_ge);
raw_numeric_fns!(f64, i32, f64 => dbl_int_eq, dbl_int_ne, dbl_int_lt, dbl_int_le, dbl_int_gt, dbl_int_ge);
raw_numeric_fns!(f64, i64, f64 => dbl_long_eq, dbl_long_ne, dbl_long_lt, dbl_long_le, dbl_long_gt, dbl_long_ge);
raw_numeric_fns!(f64, f64, f64 => dbl_dbl_eq, dbl_dbl_ne, dbl_dbl_lt, dbl_dbl_le, dbl_dbl_gt, dbl_dbl_ge);

unsafe fn ptr_ptr_eq(lhs: *const u8, rhs: *const u8, _n: usize) -> bool {
    // SAFETY: selected only for pointer-width fields.
    unsafe { lhs.cast::<usize>().read_unaligned() == rhs.cast::<usize>().read_unaligned() }
}

unsafe fn ptr_ptr_ne(lhs: *const u8, rhs: *const u8, _n: usize) -> bool {
    // SAFETY: selected only for pointer-width fields.
    unsafe { lhs.cast::<usize>().read_unaligned() != rhs.cast::<usize>().read_unaligned() }
}

macro_rules! raw_char_fn {
    ($name:ident, $($pat:pat_param)|+) => {
        unsafe fn $name(lhs: *const u8, rhs: *const u8, n: usize) -> bool {
            // SAFETY: the dispatcher passes n = min(left.size, right.size),
            // and both fields are at least that wide.
            let l = unsafe { std::slice::from_raw_parts(lhs, n) };
            let r = unsafe { std::slice::from_raw_parts(rhs, n) };
            matches!(l.cmp(r), $($pat)|+)
        }
    };
}

use std::cmp::Ordering::{Equal as OrdEq, Greater as OrdGt, Less as OrdLt};

raw_char_fn!(char_char_eq, OrdEq);
raw_char_fn!(char_char_ne, OrdLt | OrdGt);
raw_char_fn!(char_char_lt, OrdLt);
raw_char_fn!(char_char_le, OrdLt | OrdEq);
raw_char_fn!(char_char_gt, OrdGt);
raw_char_fn!(char_char_ge, OrdGt | OrdEq);

fn pick(
    op: CompareOp,
    eq: RawCompareFn,
    ne: RawCompareFn,
    lt: RawCompareFn,
    le: RawCompareFn,
    gt: RawCompareFn,
    ge: RawCompareFn,
) -> RawCompareFn {
    match op {
        CompareOp::Equal => eq,
        CompareOp::NotEqual => ne,
        CompareOp::Less => lt,
        CompareOp::LessEqual => le,
        CompareOp::Greater => gt,
        CompareOp::GreaterEqual => ge,
    }
}

/// A comparator bound to two tuple field positions and one operator.
#[derive(Debug, Clone, Copy)]
pub struct Comparator {
    loffset: usize,
    roffset: usize,
    size: usize,
    func: RawCompareFn,
}

impl Comparator {
    /// Binds a comparator over `(left column at loffset) op (right column
    /// at roffset)`.
    ///
    /// Numeric pairs promote at read time; dates compare as their
    /// underlying integers but only against other dates; pointers admit
    /// equality only. Every other cell is rejected here.
    ///
    /// Char comparisons read `min(left.size, right.size)` bytes, so two
    /// strings that agree on that prefix and differ after it compare
    /// equal. Known limitation, kept for compatibility with existing
    /// plans.
    pub fn init(
        lct: ColumnSpec,
        loffset: usize,
        rct: ColumnSpec,
        roffset: usize,
        op: CompareOp,
    ) -> Result<Self> {
        use ColumnType::*;

        let reject = || {
            Error::UnknownComparison(
                format!("no comparison {:?} {:?} {:?}", lct.ctype, op, rct.ctype).into(),
            )
        };

        let mut size = 0;
        let func = match (lct.ctype, rct.ctype) {
            (Int32, Int32) => pick(op, int_int_eq, int_int_ne, int_int_lt, int_int_le, int_int_gt, int_int_ge),
            (Int32, Int64) => pick(op, int_long_eq, int_long_ne, int_long_lt, int_long_le, int_long_gt, int_long_ge),
            (Int32, Decimal) => pick(op, int_dbl_eq, int_dbl_ne, int_dbl_lt, int_dbl_le, int_dbl_gt, int_dbl_ge),
            (Int64, Int32) => pick(op, long_int_eq, long_int_ne, long_int_lt, long_int_le, long_int_gt, long_int_ge),
            (Int64, Int64) => pick(op, long_long_eq, long_long_ne, long_long_lt, long_long_le, long_long_gt, long_long_ge),
            (Int64, Decimal) => pick(op, long_dbl_eq, long_dbl_ne, long_dbl_lt, long_dbl_le, long_dbl_gt, long_dbl_ge),
            (Decimal, Int32) => pick(op, dbl_int_eq, dbl_int_ne, dbl_int_lt, dbl_int_le, dbl_int_gt, dbl_int_ge),
            (Decimal, Int64) => pick(op, dbl_long_eq, dbl_long_ne, dbl_long_lt, dbl_long_le, dbl_long_gt, dbl_long_ge),
            (Decimal, Decimal) => pick(op, dbl_dbl_eq, dbl_dbl_ne, dbl_dbl_lt, dbl_dbl_le, dbl_dbl_gt, dbl_dbl_ge),

            // Byte-wise a date is an Int64, but it only compares against
            // another date; mixing dates with decimals makes no sense.
            (Date, Date) => pick(op, long_long_eq, long_long_ne, long_long_lt, long_long_le, long_long_gt, long_long_ge),

            (Pointer, Pointer) => match op {
                CompareOp::Equal => ptr_ptr_eq as RawCompareFn,
                CompareOp::NotEqual => ptr_ptr_ne as RawCompareFn,
                _ => return Err(reject()),
            },

            (Char(_), Char(_)) => {
                size = lct.size.min(rct.size);
                pick(op, char_char_eq, char_char_ne, char_char_lt, char_char_le, char_char_gt, char_char_ge)
            }

            _ => return Err(reject()),
        };

        Ok(Self { loffset, roffset, size, func })
    }

    /// Evaluates the bound comparison over two tuples.
    ///
    /// # Safety
    /// `ltup` and `rtup` must point to tuples laid out by the schemas the
    /// comparator was bound against, valid for the bound offsets and
    /// widths.
    #[inline]
    pub unsafe fn eval(&self, ltup: *const u8, rtup: *const u8) -> bool {
        // SAFETY: offsets are in bounds per the caller's contract.
        unsafe { (self.func)(ltup.add(self.loffset), rtup.add(self.roffset), self.size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSpec, ColumnType, Schema};

    fn spec(ctype: ColumnType) -> ColumnSpec {
        ColumnSpec { ctype, size: ctype.width() }
    }

    fn eval(cmp: &Comparator, ltup: &[u8], rtup: &[u8]) -> bool {
        unsafe { cmp.eval(ltup.as_ptr(), rtup.as_ptr()) }
    }

    #[test]
    fn test_parse_operator_strings() {
        assert_eq!(CompareOp::parse("=").unwrap(), CompareOp::Equal);
        assert_eq!(CompareOp::parse("==").unwrap(), CompareOp::Equal);
        assert_eq!(CompareOp::parse("<>").unwrap(), CompareOp::NotEqual);
        assert_eq!(CompareOp::parse("!=").unwrap(), CompareOp::NotEqual);
        assert_eq!(CompareOp::parse("<").unwrap(), CompareOp::Less);
        assert_eq!(CompareOp::parse("<=").unwrap(), CompareOp::LessEqual);
        assert_eq!(CompareOp::parse(">").unwrap(), CompareOp::Greater);
        assert_eq!(CompareOp::parse(">=").unwrap(), CompareOp::GreaterEqual);
        assert!(CompareOp::parse("===").is_err());
        assert!(CompareOp::parse("").is_err());
    }

    #[test]
    fn test_widening_int_long() {
        let cmp = Comparator::init(
            spec(ColumnType::Int32),
            0,
            spec(ColumnType::Int64),
            0,
            CompareOp::Less,
        )
        .unwrap();

        let l = 7i32.to_ne_bytes();
        let r = 1_000_000_000_000i64.to_ne_bytes();
        assert!(eval(&cmp, &l, &r));
        assert!(!eval(&cmp, &l, &7i64.to_ne_bytes()));
    }

    #[test]
    fn test_widening_long_double() {
        let cmp = Comparator::init(
            spec(ColumnType::Int64),
            0,
            spec(ColumnType::Decimal),
            0,
            CompareOp::GreaterEqual,
        )
        .unwrap();

        assert!(eval(&cmp, &10i64.to_ne_bytes(), &9.5f64.to_ne_bytes()));
        assert!(!eval(&cmp, &10i64.to_ne_bytes(), &10.5f64.to_ne_bytes()));
    }

    #[test]
    fn test_offsets_are_applied() {
        let schema = Schema::new(&[ColumnType::Int32, ColumnType::Int64]);
        let cmp = Comparator::init(
            schema.column(1),
            schema.offset(1),
            spec(ColumnType::Int64),
            0,
            CompareOp::Equal,
        )
        .unwrap();

        let mut tuple = [0u8; 12];
        tuple[4..].copy_from_slice(&42i64.to_ne_bytes());
        assert!(eval(&cmp, &tuple, &42i64.to_ne_bytes()));
        assert!(!eval(&cmp, &tuple, &43i64.to_ne_bytes()));
    }

    #[test]
    fn test_date_only_compares_with_date() {
        assert!(Comparator::init(
            spec(ColumnType::Date),
            0,
            spec(ColumnType::Date),
            0,
            CompareOp::Less
        )
        .is_ok());

        assert!(Comparator::init(
            spec(ColumnType::Date),
            0,
            spec(ColumnType::Decimal),
            0,
            CompareOp::Equal
        )
        .is_err());
    }

    #[test]
    fn test_pointer_admits_equality_only() {
        let ptr = spec(ColumnType::Pointer);
        assert!(Comparator::init(ptr, 0, ptr, 0, CompareOp::Equal).is_ok());
        assert!(Comparator::init(ptr, 0, ptr, 0, CompareOp::NotEqual).is_ok());
        assert!(Comparator::init(ptr, 0, ptr, 0, CompareOp::Less).is_err());
        assert!(Comparator::init(ptr, 0, spec(ColumnType::Int64), 0, CompareOp::Equal).is_err());
    }

    #[test]
    fn test_char_bounded_prefix() {
        let cmp = Comparator::init(
            spec(ColumnType::Char(2)),
            0,
            spec(ColumnType::Char(4)),
            0,
            CompareOp::Equal,
        )
        .unwrap();

        // Bounded prefix comparison: only min(2, 4) bytes participate,
        // so "AB" and "ABCD" compare equal.
        assert!(eval(&cmp, b"AB", b"ABCD"));
        assert!(!eval(&cmp, b"AX", b"ABCD"));

        let lt = Comparator::init(
            spec(ColumnType::Char(4)),
            0,
            spec(ColumnType::Char(4)),
            0,
            CompareOp::Less,
        )
        .unwrap();
        assert!(eval(&lt, b"ABCA", b"ABCD"));
        assert!(!eval(&lt, b"ABCD", b"ABCD"));
    }

    #[test]
    fn test_rejects_char_numeric_mix() {
        assert!(Comparator::init(
            spec(ColumnType::Char(8)),
            0,
            spec(ColumnType::Int64),
            0,
            CompareOp::Equal
        )
        .is_err());
        assert!(Comparator::init(
            spec(ColumnType::Int32),
            0,
            spec(ColumnType::Char(8)),
            0,
            CompareOp::Less
        )
        .is_err());
    }

    #[test]
    fn test_full_numeric_cell_coverage() {
        let numerics = [ColumnType::Int32, ColumnType::Int64, ColumnType::Decimal];
        let ops = [
            CompareOp::Equal,
            CompareOp::NotEqual,
            CompareOp::Less,
            CompareOp::LessEqual,
            CompareOp::Greater,
            CompareOp::GreaterEqual,
        ];

        for l in numerics {
            for r in numerics {
                for op in ops {
                    assert!(Comparator::init(spec(l), 0, spec(r), 0, op).is_ok());
                }
            }
        }
    }
}
