//! Mapping between loose remote JSON rows and the closed set of mirrored
//! entities.
//!
//! Everything that crosses the Local-Store boundary goes through [`Record`]:
//! remote rows are classified with [`classify_remote`], stored rows are read
//! back with [`Record::from_row`], and both paths run the entity invariants.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::errors::RecordError;
use crate::models::{
    format_ts, parse_ts, Book, Borrowing, BorrowingStatus, Category, Class, Fine, Staff, Student,
};

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// The mirrored tables, in dependency order (referenced tables first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Categories,
    Classes,
    Books,
    Students,
    Staff,
    Borrowings,
    Fines,
}

impl Table {
    pub const COUNT: usize = 7;

    pub const ALL: [Table; Self::COUNT] = [
        Table::Categories,
        Table::Classes,
        Table::Books,
        Table::Students,
        Table::Staff,
        Table::Borrowings,
        Table::Fines,
    ];

    /// Table name, identical locally and on the remote.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Categories => "categories",
            Self::Classes => "classes",
            Self::Books => "books",
            Self::Students => "students",
            Self::Staff => "staff",
            Self::Borrowings => "borrowings",
            Self::Fines => "fines",
        }
    }

    /// Stable position of this table in [`Table::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Persisted columns, in the order used for inserts.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Self::Categories => &["id", "name", "description", "created_at", "updated_at"],
            Self::Classes => &[
                "id",
                "name",
                "grade_level",
                "max_books_allowed",
                "created_at",
                "updated_at",
            ],
            Self::Books => &[
                "id",
                "title",
                "author",
                "isbn",
                "category_id",
                "total_copies",
                "available_copies",
                "created_at",
                "updated_at",
            ],
            Self::Students => &[
                "id",
                "student_id",
                "name",
                "email",
                "class_id",
                "status",
                "created_at",
                "updated_at",
            ],
            Self::Staff => &[
                "id",
                "staff_id",
                "name",
                "role",
                "department",
                "status",
                "created_at",
                "updated_at",
            ],
            Self::Borrowings => &[
                "id",
                "book_id",
                "student_id",
                "borrow_date",
                "due_date",
                "return_date",
                "status",
                "fine_amount",
                "created_at",
                "updated_at",
            ],
            Self::Fines => &[
                "id",
                "borrowing_id",
                "student_id",
                "amount",
                "reason",
                "status",
                "paid_date",
                "created_at",
                "updated_at",
            ],
        }
    }
}

impl FromStr for Table {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| RecordError::UnknownTable(s.to_string()))
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A validated row of one of the mirrored tables.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Book(Book),
    Category(Category),
    Student(Student),
    Class(Class),
    Staff(Staff),
    Borrowing(Borrowing),
    Fine(Fine),
}

macro_rules! each_record {
    ($rec:expr, $inner:ident => $body:expr) => {
        match $rec {
            Record::Book($inner) => $body,
            Record::Category($inner) => $body,
            Record::Student($inner) => $body,
            Record::Class($inner) => $body,
            Record::Staff($inner) => $body,
            Record::Borrowing($inner) => $body,
            Record::Fine($inner) => $body,
        }
    };
}

impl Record {
    pub fn table(&self) -> Table {
        match self {
            Self::Book(_) => Table::Books,
            Self::Category(_) => Table::Categories,
            Self::Student(_) => Table::Students,
            Self::Class(_) => Table::Classes,
            Self::Staff(_) => Table::Staff,
            Self::Borrowing(_) => Table::Borrowings,
            Self::Fine(_) => Table::Fines,
        }
    }

    pub fn id(&self) -> &str {
        each_record!(self, r => &r.id)
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        each_record!(self, r => r.updated_at)
    }

    pub fn set_updated_at(&mut self, ts: DateTime<Utc>) {
        each_record!(self, r => r.updated_at = ts)
    }

    /// Give a record created offline its primary key. Keys are v4 UUIDs, the
    /// same shape the remote generates, so offline creates never collide.
    /// Returns `true` if an id was assigned.
    pub fn assign_id_if_missing(&mut self) -> bool {
        if !self.id().trim().is_empty() {
            return false;
        }
        let id = uuid::Uuid::new_v4().to_string();
        each_record!(self, r => r.id = id);
        true
    }

    /// Classify a JSON object as an entity of `table` and check its invariants.
    pub fn from_value(table: Table, value: Value) -> Result<Self, RecordError> {
        if !value.is_object() {
            return Err(RecordError::NotAnObject {
                table: table.to_string(),
            });
        }
        let record = match table {
            Table::Books => Self::Book(decode(table, value)?),
            Table::Categories => Self::Category(decode(table, value)?),
            Table::Students => Self::Student(decode(table, value)?),
            Table::Classes => Self::Class(decode(table, value)?),
            Table::Staff => Self::Staff(decode(table, value)?),
            Table::Borrowings => Self::Borrowing(decode(table, value)?),
            Table::Fines => Self::Fine(decode(table, value)?),
        };
        record.validate()?;
        Ok(record)
    }

    /// Full-record JSON payload as sent to the remote.
    pub fn to_value(&self) -> Result<Value, RecordError> {
        each_record!(self, r => encode(self.table(), r))
    }

    /// Check the entity invariants.
    pub fn validate(&self) -> Result<(), RecordError> {
        let table = self.table();
        let violation = |detail: String| RecordError::InvariantViolation {
            table: table.to_string(),
            id: self.id().to_string(),
            detail,
        };

        if self.id().trim().is_empty() {
            return Err(violation("id is empty".into()));
        }

        match self {
            Self::Book(b) => {
                if b.total_copies < 0 {
                    return Err(violation(format!(
                        "total_copies is negative ({})",
                        b.total_copies
                    )));
                }
                if b.available_copies < 0 || b.available_copies > b.total_copies {
                    return Err(violation(format!(
                        "available_copies {} outside 0..={}",
                        b.available_copies, b.total_copies
                    )));
                }
            }
            Self::Class(c) => {
                if c.max_books_allowed < 0 {
                    return Err(violation("max_books_allowed is negative".into()));
                }
            }
            Self::Borrowing(b) => {
                let returned = b.status == BorrowingStatus::Returned;
                if returned != b.return_date.is_some() {
                    return Err(violation(format!(
                        "return_date must be set iff status is returned (status {})",
                        b.status
                    )));
                }
                if b.status == BorrowingStatus::Overdue && b.due_date >= Utc::now().date_naive() {
                    return Err(violation(format!(
                        "overdue borrowing has due_date {} not in the past",
                        b.due_date
                    )));
                }
                if b.due_date < b.borrow_date {
                    return Err(violation("due_date precedes borrow_date".into()));
                }
            }
            Self::Fine(f) => {
                if !f.amount.is_finite() || f.amount < 0.0 {
                    return Err(violation(format!("amount {} is not a valid sum", f.amount)));
                }
            }
            Self::Category(_) | Self::Student(_) | Self::Staff(_) => {}
        }
        Ok(())
    }

    /// Column values in [`Table::columns`] order, ready for binding.
    pub fn column_values(&self) -> Result<Vec<SqlValue>, RecordError> {
        let value = self.to_value()?;
        Ok(self
            .table()
            .columns()
            .iter()
            .map(|col| match (*col, value.get(*col)) {
                ("created_at" | "updated_at", Some(Value::String(s))) => match parse_ts(s) {
                    Some(ts) => SqlValue::Text(format_ts(&ts)),
                    None => SqlValue::Text(s.clone()),
                },
                (_, cell) => json_to_sql(cell.unwrap_or(&Value::Null)),
            })
            .collect())
    }

    /// Rebuild a record from a row selected with [`Table::columns`].
    pub fn from_row(table: Table, row: &rusqlite::Row<'_>) -> Result<Self, RecordError> {
        let mut object = serde_json::Map::new();
        for (idx, col) in table.columns().iter().enumerate() {
            let cell = row.get_ref(idx).map_err(|e| RecordError::InvalidShape {
                table: table.to_string(),
                detail: format!("column {col}: {e}"),
            })?;
            object.insert((*col).to_string(), sql_to_json(cell));
        }
        Self::from_value(table, Value::Object(object))
    }
}

fn decode<T: DeserializeOwned>(table: Table, value: Value) -> Result<T, RecordError> {
    serde_json::from_value(value).map_err(|e| RecordError::InvalidShape {
        table: table.to_string(),
        detail: e.to_string(),
    })
}

fn encode<T: Serialize>(table: Table, entity: &T) -> Result<Value, RecordError> {
    serde_json::to_value(entity).map_err(|e| RecordError::InvalidShape {
        table: table.to_string(),
        detail: e.to_string(),
    })
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(cell: ValueRef<'_>) -> Value {
    match cell {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

// ---------------------------------------------------------------------------
// Remote rows
// ---------------------------------------------------------------------------

/// A classified row pulled from the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteRow {
    /// A live record to upsert locally.
    Upsert(Record),
    /// A soft-deleted record (`deleted_at` set) to remove locally.
    Tombstone {
        id: String,
        updated_at: DateTime<Utc>,
    },
}

impl RemoteRow {
    pub fn id(&self) -> &str {
        match self {
            Self::Upsert(r) => r.id(),
            Self::Tombstone { id, .. } => id,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::Upsert(r) => r.updated_at(),
            Self::Tombstone { updated_at, .. } => *updated_at,
        }
    }
}

/// Read `updated_at` from a loose JSON row.
pub fn value_updated_at(value: &Value) -> Option<DateTime<Utc>> {
    value.get("updated_at").and_then(Value::as_str).and_then(parse_ts)
}

/// Classify a remote JSON row for `table`.
pub fn classify_remote(table: Table, value: Value) -> Result<RemoteRow, RecordError> {
    let deleted_at = value
        .get("deleted_at")
        .and_then(Value::as_str)
        .and_then(parse_ts);

    match deleted_at {
        Some(deleted_at) => {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| RecordError::InvalidShape {
                    table: table.to_string(),
                    detail: "tombstone without id".into(),
                })?;
            let updated_at = value_updated_at(&value)
                .map(|u| u.max(deleted_at))
                .unwrap_or(deleted_at);
            Ok(RemoteRow::Tombstone {
                id: id.to_string(),
                updated_at,
            })
        }
        None => Record::from_value(table, value).map(RemoteRow::Upsert),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn book_json(available: i64, total: i64) -> Value {
        json!({
            "id": "book123",
            "title": "Things Fall Apart",
            "author": "Chinua Achebe",
            "isbn": "978-0385474542",
            "category_id": null,
            "total_copies": total,
            "available_copies": available,
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-02T00:00:00Z",
            "shelf_location": "A3"
        })
    }

    #[test]
    fn test_table_names_roundtrip() {
        for table in Table::ALL {
            assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
            assert_eq!(Table::ALL[table.index()], table);
        }
        assert!(matches!(
            "loans".parse::<Table>(),
            Err(RecordError::UnknownTable(_))
        ));
    }

    #[test]
    fn test_book_classified_with_extra_fields() {
        let record = Record::from_value(Table::Books, book_json(2, 5)).unwrap();
        assert_eq!(record.table(), Table::Books);
        assert_eq!(record.id(), "book123");
        let Record::Book(book) = record else {
            panic!("expected a book");
        };
        assert_eq!(book.available_copies, 2);
    }

    #[test]
    fn test_book_copies_invariant() {
        let err = Record::from_value(Table::Books, book_json(6, 5)).unwrap_err();
        assert!(matches!(err, RecordError::InvariantViolation { .. }));
        let err = Record::from_value(Table::Books, book_json(-1, 5)).unwrap_err();
        assert!(matches!(err, RecordError::InvariantViolation { .. }));
    }

    #[test]
    fn test_missing_field_is_invalid_shape() {
        let mut value = book_json(1, 1);
        value.as_object_mut().unwrap().remove("title");
        let err = Record::from_value(Table::Books, value).unwrap_err();
        assert!(matches!(err, RecordError::InvalidShape { .. }));

        let err = Record::from_value(Table::Books, json!([1, 2])).unwrap_err();
        assert!(matches!(err, RecordError::NotAnObject { .. }));
    }

    #[test]
    fn test_borrowing_return_date_invariant() {
        let base = json!({
            "id": "br1",
            "book_id": "book123",
            "student_id": "s1",
            "borrow_date": "2025-01-01",
            "due_date": "2025-01-15",
            "return_date": null,
            "status": "returned",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        });
        assert!(Record::from_value(Table::Borrowings, base.clone()).is_err());

        let mut ok = base.clone();
        ok["return_date"] = json!("2025-01-10");
        assert!(Record::from_value(Table::Borrowings, ok).is_ok());

        let mut overdue = base;
        overdue["status"] = json!("overdue");
        assert!(Record::from_value(Table::Borrowings, overdue.clone()).is_ok());

        overdue["due_date"] = json!("2999-01-01");
        assert!(Record::from_value(Table::Borrowings, overdue).is_err());
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        let value = json!({
            "id": "f1",
            "borrowing_id": "br1",
            "student_id": "s1",
            "amount": 5.0,
            "reason": "late",
            "status": "forgiven",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        });
        assert!(matches!(
            Record::from_value(Table::Fines, value),
            Err(RecordError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_tombstone_classification() {
        let mut value = book_json(1, 1);
        value["deleted_at"] = json!("2025-01-03T00:00:00Z");
        let row = classify_remote(Table::Books, value).unwrap();
        assert_eq!(row.id(), "book123");
        assert_eq!(row.updated_at(), parse_ts("2025-01-03T00:00:00Z").unwrap());
        assert!(matches!(row, RemoteRow::Tombstone { .. }));

        let row = classify_remote(Table::Books, book_json(1, 1)).unwrap();
        assert!(matches!(row, RemoteRow::Upsert(_)));
    }

    #[test]
    fn test_column_values_follow_column_order() {
        let record = Record::from_value(Table::Books, book_json(2, 5)).unwrap();
        let values = record.column_values().unwrap();
        assert_eq!(values.len(), Table::Books.columns().len());
        assert_eq!(values[0], SqlValue::Text("book123".into()));
        assert_eq!(values[4], SqlValue::Null);
        assert_eq!(values[5], SqlValue::Integer(5));
    }
}
