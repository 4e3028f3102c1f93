//! Hash function family
//!
//! Every hasher maps a key to a bucket id in `[0, buckets())`. Bucket
//! counts are rounded up to the next power of two, except for the
//! exact-range and always-zero hashers which report exactly what was
//! requested. Dispatch is a tagged variant per hasher; the variant is
//! chosen once at plan time and the data plane pays a single match.

use crate::config::Node;
use crate::error::{Error, Result};
use crate::schema::Schema;

/// Base-2 logarithm of the next higher power of two.
pub fn log2_ceil(k: u32) -> u32 {
    if k <= 1 {
        0
    } else {
        32 - (k - 1).leading_zeros()
    }
}

const FNV_64_OFFSET: u64 = 14_695_981_039_346_656_037;

/// Knuth's multiplicative constant, close to 2^32 / golden ratio.
const KNUTH_MULTIPLIER: u64 = 2_654_435_761;

/// A hash function over numeric or byte-string keys.
#[derive(Debug, Clone, PartialEq)]
pub enum HashFn {
    /// One bucket; always hashes to zero. For aggregation with no
    /// grouping.
    AlwaysZero,
    /// `x & (2^k - 1)`
    Modulo(Modulo),
    /// `((x - offset) & mask) >> skipbits`
    ParameterizedModulo(ParameterizedModulo),
    /// Multiplicative hash, then bit selection. Works well for
    /// sequential keys without producing a sequential access pattern.
    Knuth(ParameterizedModulo),
    /// Power-of-two buckets partitioning `[min, max]`
    Range(Range),
    /// Exactly as many buckets as requested, partitioning `[min, max]`
    ExactRange(ExactRange),
    /// FNV-1a over the key bytes, folded to `k` bits
    Bytes(Bytes),
    /// Hashes the byte positions that form the TPC-H Q1 group-by
    TpchQ1Magic,
    /// Exploits the o_orderkey domain, which zeroes bits 3 and 4.
    /// Taking advantage of this is illegal per the TPC-H specs.
    TpchOrderKey(Modulo),
    /// 64-bit finalizer-style mixer
    Willis(Modulo),
}

/// Mask-based modulo hasher parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modulo {
    mask: u64,
}

impl Modulo {
    fn new(buckets: u32) -> Self {
        Self { mask: (1u64 << log2_ceil(buckets)) - 1 }
    }
}

/// Parameterized modulo: a value offset so that key `offset` hashes to
/// zero, and `skipbits` low-order bits discarded before bucket selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterizedModulo {
    offset: i64,
    /// Modulo mask, pre-shifted left by `skipbits`.
    mask: u64,
    skipbits: u32,
}

impl ParameterizedModulo {
    fn new(offset: i64, buckets: u32, skipbits: u32) -> Self {
        let mask = ((1u64 << log2_ceil(buckets)) - 1) << skipbits;
        Self { offset, mask, skipbits }
    }

    fn buckets(&self) -> u32 {
        ((self.mask >> self.skipbits) + 1) as u32
    }
}

/// Range partitioning parameters; bucket count is a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    min: i64,
    max: i64,
    k: u32,
}

/// Exact range partitioning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExactRange {
    min: i64,
    max: i64,
    buckets: u32,
    bucket_range: i64,
}

impl ExactRange {
    fn new(min: i64, max: i64, buckets: u32) -> Self {
        let bucket_range = (max - min + buckets as i64) / buckets as i64;
        Self { min, max, buckets, bucket_range }
    }

    /// Smallest value that hashes to `bucket`; `max + 1` for the
    /// one-past-the-end bucket.
    pub fn minimum_for_bucket(&self, bucket: u32) -> i64 {
        if bucket == self.buckets {
            return self.max + 1;
        }
        bucket as i64 * self.bucket_range + self.min
    }
}

/// FNV-1a byte hasher folded to `k` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bytes {
    k: u32,
}

impl HashFn {
    /// Domain size: this function hashes to `[0, buckets())`.
    pub fn buckets(&self) -> u32 {
        match self {
            HashFn::AlwaysZero => 1,
            HashFn::Modulo(m) | HashFn::TpchOrderKey(m) | HashFn::Willis(m) => {
                (m.mask + 1) as u32
            }
            HashFn::ParameterizedModulo(p) | HashFn::Knuth(p) => p.buckets(),
            HashFn::Range(r) => 1 << r.k,
            HashFn::ExactRange(e) => e.buckets,
            HashFn::Bytes(b) => 1 << b.k,
            HashFn::TpchQ1Magic => 4,
        }
    }

    /// Hashes a single numeric key.
    #[inline]
    pub fn hash_value(&self, value: i64) -> u32 {
        match self {
            HashFn::AlwaysZero => 0,
            HashFn::TpchQ1Magic => tpch_q1_mix(value as u32),
            HashFn::Modulo(m) => (value as u64 & m.mask) as u32,
            HashFn::ParameterizedModulo(p) => {
                ((value.wrapping_sub(p.offset) as u64 & p.mask) >> p.skipbits) as u32
            }
            HashFn::Knuth(p) => {
                (((value as u64).wrapping_mul(KNUTH_MULTIPLIER) & p.mask) >> p.skipbits) as u32
            }
            HashFn::Range(r) => (((value - r.min) << r.k) / (r.max - r.min + 1)) as u32,
            HashFn::ExactRange(e) => ((value - e.min) / e.bucket_range) as u32,
            HashFn::Bytes(_) => {
                // Byte hashers treat a numeric key as its raw bytes.
                self.hash_raw_bytes(&value.to_ne_bytes())
            }
            HashFn::TpchOrderKey(m) => ((((value >> 2) & !7) | (value & 7)) as u64 & m.mask) as u32,
            HashFn::Willis(m) => {
                let mut l = value;
                l = (!l).wrapping_add(l << 21);
                l ^= l >> 24;
                l = l.wrapping_add(l << 3).wrapping_add(l << 8); // l * 265
                l ^= l >> 14;
                l = l.wrapping_add(l << 2).wrapping_add(l << 4); // l * 21
                l ^= l >> 28;
                l = l.wrapping_add(l << 31);
                l = if l > 0 { l } else { l.wrapping_neg() };
                (l as u64 & m.mask) as u32
            }
        }
    }

    /// Hashes a key given as raw bytes. Value hashers read the bytes as
    /// a 4- or 8-byte integer; any other width is an illegal conversion.
    pub fn hash_bytes(&self, bytes: &[u8]) -> Result<u32> {
        match self {
            HashFn::AlwaysZero => Ok(0),
            HashFn::Bytes(_) => Ok(self.hash_raw_bytes(bytes)),
            HashFn::TpchQ1Magic => {
                let v = u32::from_ne_bytes(
                    bytes
                        .get(..4)
                        .and_then(|b| b.try_into().ok())
                        .ok_or(Error::IllegalConversion { width: bytes.len() })?,
                );
                Ok(tpch_q1_mix(v))
            }
            _ => Ok(self.hash_value(numericalize(bytes)?)),
        }
    }

    #[inline]
    fn hash_raw_bytes(&self, bytes: &[u8]) -> u32 {
        let k = match self {
            HashFn::Bytes(b) => b.k,
            _ => unreachable!("raw byte hashing is only defined for the bytes hasher"),
        };
        debug_assert!(!bytes.is_empty());

        let mut hash = FNV_64_OFFSET;
        for &b in bytes {
            hash ^= b as u64;
            // The FNV-1a prime is 2^40 + 0x1B3, so the multiplication
            // reduces to shifts.
            hash = hash
                .wrapping_add(hash << 1)
                .wrapping_add(hash << 4)
                .wrapping_add(hash << 5)
                .wrapping_add(hash << 7)
                .wrapping_add(hash << 8)
                .wrapping_add(hash << 40);
        }

        (((hash >> k) ^ hash) & ((1u64 << k) - 1)) as u32
    }

    /// Splits a parameterized-modulo hasher into a set of hashers for
    /// multiple partitioning passes: the significant bits are divided
    /// into disjoint contiguous ranges, highest bits hashed first. The
    /// union of the generated masks equals the original mask.
    pub fn generate(&self, passes: u32) -> Result<Vec<HashFn>> {
        let p = match self {
            HashFn::ParameterizedModulo(p) => p,
            _ => {
                return Err(Error::UnknownHash(
                    "multi-pass generation is only defined for parammodulo".into(),
                ))
            }
        };

        let total_bits = log2_ceil(self.buckets() - 1);
        let bits_per_pass = total_bits / passes;

        let mut ret = Vec::with_capacity(passes as usize);
        for i in 0..passes - 1 {
            ret.push(HashFn::ParameterizedModulo(ParameterizedModulo::new(
                p.offset,
                1 << bits_per_pass,
                p.skipbits + total_bits - (i + 1) * bits_per_pass,
            )));
        }

        let last_bits = total_bits - (passes - 1) * bits_per_pass;
        ret.push(HashFn::ParameterizedModulo(ParameterizedModulo::new(
            p.offset,
            1 << last_bits,
            p.skipbits,
        )));

        debug_assert_eq!(
            ret.iter().fold(0u64, |acc, f| match f {
                HashFn::ParameterizedModulo(g) => acc | g.mask,
                _ => acc,
            }),
            p.mask
        );

        Ok(ret)
    }
}

#[inline]
fn tpch_q1_mix(v: u32) -> u32 {
    (((v >> 4) | (v >> 16)) & 0x1) | ((v >> 1) & 0x2)
}

fn numericalize(bytes: &[u8]) -> Result<i64> {
    match bytes.len() {
        4 => Ok(i32::from_ne_bytes(bytes.try_into().expect("length checked")) as i64),
        8 => Ok(i64::from_ne_bytes(bytes.try_into().expect("length checked"))),
        width => Err(Error::IllegalConversion { width }),
    }
}

/// How the key bytes are pulled out of a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    /// Raw bytes handed to a byte hasher
    Raw,
    /// 4-byte numeric read
    Num32,
    /// 8-byte numeric read
    Num64,
}

/// A hash function bound to a key position inside a tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleHasher {
    offset: usize,
    size: usize,
    kind: KeyKind,
    func: HashFn,
}

impl TupleHasher {
    /// Resolves a `hash` configuration group against a schema.
    ///
    /// ```text
    /// hash = {
    ///     fn = "bytes" | "modulo" | "range" | "exactrange" | "parammodulo"
    ///        | "knuth" | "tpchorderkey" | "tpchq1magic" | "willis"
    ///        | "alwayszero";
    ///     buckets = <number>;
    ///     field = <number>; | fieldrange = [<number>, <number>];
    ///     range = [<min>, <max>];          # range, exactrange
    ///     offset = <number>; skipbits = <number>;   # parammodulo, knuth
    /// }
    /// ```
    pub fn create(schema: &Schema, node: &Node) -> Result<Self> {
        let name = node.str("fn")?;

        // If no hashing is desired, don't bother checking further.
        if name == "alwayszero" {
            return Ok(Self { offset: 0, size: 0, kind: KeyKind::Raw, func: HashFn::AlwaysZero });
        }

        let buckets = node.int("buckets")?;
        if buckets <= 0 {
            return Err(Error::Config("number of hash buckets cannot be zero".into()));
        }
        let buckets = buckets as u32;

        let (field_min, field_max) = if node.exists("fieldrange") {
            let range = node.int_list("fieldrange", 2)?;
            (range[0] as usize, range[1] as usize)
        } else {
            let field = node.int("field")? as usize;
            (field, field)
        };
        if field_max >= schema.columns() || field_min > field_max {
            return Err(Error::IllegalSchema("hash field out of range".into()));
        }

        let offset = schema.offset(field_min);
        let size: usize = (field_min..=field_max).map(|i| schema.column(i).size).sum();

        let func = match name {
            "bytes" => {
                return Ok(Self {
                    offset,
                    size,
                    kind: KeyKind::Raw,
                    func: HashFn::Bytes(Bytes { k: log2_ceil(buckets) }),
                });
            }
            "tpchq1magic" => {
                return Ok(Self { offset, size, kind: KeyKind::Raw, func: HashFn::TpchQ1Magic });
            }
            _ => {
                // A value hasher: exactly one field, and it must be numeric.
                if field_min != field_max {
                    return Err(Error::IllegalSchema(
                        "value hashers cannot hash a composite key".into(),
                    ));
                }
                if !schema.column(field_min).ctype.is_numeric() {
                    return Err(Error::IllegalSchema(
                        "value hashers need a numeric key field".into(),
                    ));
                }

                match name {
                    "modulo" => HashFn::Modulo(Modulo::new(buckets)),
                    "range" => {
                        let range = node.int_list("range", 2)?;
                        HashFn::Range(Range {
                            min: range[0],
                            max: range[1],
                            k: log2_ceil(buckets),
                        })
                    }
                    "exactrange" => {
                        let range = node.int_list("range", 2)?;
                        HashFn::ExactRange(ExactRange::new(range[0], range[1], buckets))
                    }
                    "parammodulo" => HashFn::ParameterizedModulo(ParameterizedModulo::new(
                        node.int_or("offset", 0)?,
                        buckets,
                        node.int_or("skipbits", 0)? as u32,
                    )),
                    "knuth" => HashFn::Knuth(ParameterizedModulo::new(
                        node.int_or("offset", 0)?,
                        buckets,
                        node.int_or("skipbits", 0)? as u32,
                    )),
                    "tpchorderkey" => HashFn::TpchOrderKey(Modulo::new(buckets)),
                    "willis" => HashFn::Willis(Modulo::new(buckets)),
                    other => {
                        return Err(Error::UnknownHash(
                            format!("unknown hash function `{other}`").into(),
                        ))
                    }
                }
            }
        };

        let kind = match schema.column(field_min).size {
            4 => KeyKind::Num32,
            8 => KeyKind::Num64,
            width => return Err(Error::IllegalConversion { width }),
        };

        Ok(Self { offset, size, kind, func })
    }

    /// Builds a hasher over an explicit function and key position.
    pub fn bind(func: HashFn, offset: usize, size: usize) -> Self {
        let kind = match (&func, size) {
            (HashFn::Bytes(_) | HashFn::TpchQ1Magic | HashFn::AlwaysZero, _) => KeyKind::Raw,
            (_, 4) => KeyKind::Num32,
            _ => KeyKind::Num64,
        };
        Self { offset, size, kind, func }
    }

    /// Hashes the key field(s) of one tuple.
    #[inline]
    pub fn hash(&self, tuple: &[u8]) -> u32 {
        match self.kind {
            KeyKind::Raw => match &self.func {
                HashFn::AlwaysZero => 0,
                f => f
                    .hash_bytes(&tuple[self.offset..self.offset + self.size])
                    .expect("byte hashers accept any key width"),
            },
            KeyKind::Num32 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&tuple[self.offset..self.offset + 4]);
                self.func.hash_value(i32::from_ne_bytes(buf) as i64)
            }
            KeyKind::Num64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&tuple[self.offset..self.offset + 8]);
                self.func.hash_value(i64::from_ne_bytes(buf))
            }
        }
    }

    /// Domain size of the underlying function.
    pub fn buckets(&self) -> u32 {
        self.func.buckets()
    }

    /// The underlying hash function.
    pub fn function(&self) -> &HashFn {
        &self.func
    }
}
