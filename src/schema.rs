//! Tuple schemas
//!
//! A schema is an immutable, ordered sequence of fixed-width columns. It
//! fixes the byte layout of every tuple an operator produces: column `i`
//! lives at a fixed offset inside the tuple, and the tuple size is the sum
//! of all column widths.

use crate::config::Node;
use crate::error::{Error, Result};

/// Column type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 64-bit floating point decimal
    Decimal,
    /// Fixed-width character string of `n` bytes
    Char(u16),
    /// Raw pointer-sized value; only equality comparisons make sense
    Pointer,
    /// Date, stored as a 64-bit integer
    Date,
}

impl ColumnType {
    /// Byte width of a value of this type.
    pub fn width(self) -> usize {
        match self {
            ColumnType::Int32 => 4,
            ColumnType::Int64 | ColumnType::Decimal | ColumnType::Pointer | ColumnType::Date => 8,
            ColumnType::Char(n) => n as usize,
        }
    }

    /// True for types whose bytes can be read as a single numeric value.
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Int32 | ColumnType::Int64 | ColumnType::Date)
    }
}

/// One column of a schema: its type and byte width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Type tag
    pub ctype: ColumnType,
    /// Width in bytes; equals `ctype.width()`
    pub size: usize,
}

/// An immutable ordered sequence of fixed-width columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnSpec>,
    offsets: Vec<usize>,
    tuple_size: usize,
}

impl Schema {
    /// Builds a schema from column types. Offsets are assigned in order.
    pub fn new(types: &[ColumnType]) -> Self {
        let mut columns = Vec::with_capacity(types.len());
        let mut offsets = Vec::with_capacity(types.len());
        let mut tuple_size = 0;

        for &ctype in types {
            offsets.push(tuple_size);
            let size = ctype.width();
            columns.push(ColumnSpec { ctype, size });
            tuple_size += size;
        }

        Self { columns, offsets, tuple_size }
    }

    /// Builds a schema from a configuration list of type names:
    /// `schema = ["int", "long", "char(20)", "decimal", "date"]`.
    pub fn from_config(node: &Node) -> Result<Self> {
        let list = node.as_list()?;
        let mut types = Vec::with_capacity(list.len());

        for entry in list {
            let name = entry.as_str()?;
            types.push(parse_column_type(name)?);
        }

        Ok(Self::new(&types))
    }

    /// Number of columns.
    pub fn columns(&self) -> usize {
        self.columns.len()
    }

    /// Size of one tuple in bytes.
    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    /// Byte offset of column `col` inside a tuple.
    pub fn offset(&self, col: usize) -> usize {
        self.offsets[col]
    }

    /// Type and width of column `col`.
    pub fn column(&self, col: usize) -> ColumnSpec {
        self.columns[col]
    }
}

fn parse_column_type(name: &str) -> Result<ColumnType> {
    let trimmed = name.trim();
    if let Some(rest) = trimmed.strip_prefix("char(") {
        let inner = rest
            .strip_suffix(')')
            .ok_or_else(|| Error::Config(format!("malformed column type `{trimmed}`").into()))?;
        let n: u16 = inner
            .parse()
            .map_err(|_| Error::Config(format!("malformed char width in `{trimmed}`").into()))?;
        if n == 0 {
            return Err(Error::IllegalSchema("char column of width zero".into()));
        }
        return Ok(ColumnType::Char(n));
    }

    match trimmed {
        "int" => Ok(ColumnType::Int32),
        "long" => Ok(ColumnType::Int64),
        "decimal" => Ok(ColumnType::Decimal),
        "pointer" => Ok(ColumnType::Pointer),
        "date" => Ok(ColumnType::Date),
        other => Err(Error::IllegalSchema(
            format!("unknown column type `{other}`").into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Node;

    #[test]
    fn test_offsets_and_tuple_size() {
        let schema = Schema::new(&[
            ColumnType::Int32,
            ColumnType::Int64,
            ColumnType::Char(20),
            ColumnType::Decimal,
        ]);

        assert_eq!(schema.columns(), 4);
        assert_eq!(schema.offset(0), 0);
        assert_eq!(schema.offset(1), 4);
        assert_eq!(schema.offset(2), 12);
        assert_eq!(schema.offset(3), 32);
        assert_eq!(schema.tuple_size(), 40);
    }

    #[test]
    fn test_from_config() {
        let node = Node::List(vec![
            Node::Str("long".into()),
            Node::Str("char(16)".into()),
            Node::Str("date".into()),
        ]);

        let schema = Schema::from_config(&node).unwrap();
        assert_eq!(schema.columns(), 3);
        assert_eq!(schema.column(0).ctype, ColumnType::Int64);
        assert_eq!(schema.column(1).ctype, ColumnType::Char(16));
        assert_eq!(schema.column(2).ctype, ColumnType::Date);
        assert_eq!(schema.tuple_size(), 32);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let node = Node::List(vec![Node::Str("uuid".into())]);
        assert!(Schema::from_config(&node).is_err());

        let node = Node::List(vec![Node::Str("char(0)".into())]);
        assert!(Schema::from_config(&node).is_err());
    }
}
