//! Result synthesis for intercepted queries
//!
//! A plugin that intercepts a query answers it with its own rows. Those rows
//! are checked against their row description and turned into the same backend
//! messages a PostgreSQL server would have sent, so the client-facing encoder
//! cannot tell the difference.

use crate::error::RouterError;
use crate::plugin::schema::{ErrorResponse, Intercept, Row, RowColumn, RowDescription};
use crate::shard::ResultSet;
use bytes::{BufMut, Bytes, BytesMut};

/// Backend message produced for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    RowDescription(RowDescription),
    DataRow(Row),
    CommandComplete(String),
    ErrorResponse(ErrorResponse),
}

impl BackendMessage {
    /// Message type byte.
    pub fn code(&self) -> u8 {
        match self {
            BackendMessage::RowDescription(_) => b'T',
            BackendMessage::DataRow(_) => b'D',
            BackendMessage::CommandComplete(_) => b'C',
            BackendMessage::ErrorResponse(_) => b'E',
        }
    }

    /// Encode in PostgreSQL wire format, including type byte and length.
    ///
    /// A message whose counts or lengths overflow their wire fields is
    /// rejected and leaves `buf` untouched.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), RouterError> {
        let frame = buf.len();
        let result = self.encode_frame(buf);
        if result.is_err() {
            buf.truncate(frame);
        }
        result
    }

    fn encode_frame(&self, buf: &mut BytesMut) -> Result<(), RouterError> {
        buf.put_u8(self.code());
        let start = buf.len();
        buf.put_i32(0);

        match self {
            BackendMessage::RowDescription(description) => {
                buf.put_i16(column_count(description.len())?);
                for column in &description.columns {
                    put_string(buf, &column.name);
                    buf.put_i32(0); // table oid
                    buf.put_i16(0); // column attribute number
                    buf.put_i32(column.oid);
                    buf.put_i16(-1); // type size
                    buf.put_i32(-1); // type modifier
                    buf.put_i16(0); // text format
                }
            }
            BackendMessage::DataRow(row) => {
                buf.put_i16(column_count(row.columns.len())?);
                for column in &row.columns {
                    buf.put_i32(column_length(column)?);
                    if let Some(data) = &column.0 {
                        buf.put_slice(data);
                    }
                }
            }
            BackendMessage::CommandComplete(tag) => put_string(buf, tag),
            BackendMessage::ErrorResponse(error) => {
                buf.put_u8(b'S');
                put_string(buf, &error.severity);
                buf.put_u8(b'V');
                put_string(buf, &error.severity);
                buf.put_u8(b'C');
                put_string(buf, &error.code);
                buf.put_u8(b'M');
                put_string(buf, &error.message);
                if !error.detail.is_empty() {
                    buf.put_u8(b'D');
                    put_string(buf, &error.detail);
                }
                buf.put_u8(0);
            }
        }

        let size = buf.len() - start;
        let len = i32::try_from(size).map_err(|_| RouterError::Oversized {
            what: "message length",
            size,
            limit: MAX_LENGTH,
        })?;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, RouterError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

const MAX_COLUMNS: usize = i16::MAX as usize;
const MAX_LENGTH: usize = i32::MAX as usize;

fn column_count(columns: usize) -> Result<i16, RouterError> {
    i16::try_from(columns).map_err(|_| RouterError::Oversized {
        what: "column count",
        size: columns,
        limit: MAX_COLUMNS,
    })
}

fn column_length(column: &RowColumn) -> Result<i32, RouterError> {
    column.length().ok_or_else(|| RouterError::Oversized {
        what: "column value length",
        size: column.0.as_ref().map_or(0, |data| data.len()),
        limit: MAX_LENGTH,
    })
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Check that every row has as many columns as the row description and that
/// the result fits the wire format.
pub fn validate(intercept: &Intercept) -> Result<(), RouterError> {
    let expected = intercept.row_description.len();
    column_count(expected)?;

    if let Some(row) = intercept
        .rows
        .iter()
        .position(|row| row.columns.len() != expected)
    {
        return Err(RouterError::Shape {
            row,
            expected,
            actual: intercept.rows[row].columns.len(),
        });
    }

    intercept
        .rows
        .iter()
        .flat_map(|row| &row.columns)
        .try_for_each(|column| column_length(column).map(|_| ()))
}

/// Validate `intercept` and turn it into the messages a backend would send.
///
/// Nothing is produced unless every row is valid.
pub fn synthesize(intercept: Intercept) -> Result<Vec<BackendMessage>, RouterError> {
    validate(&intercept)?;
    Ok(result_messages(ResultSet::from(intercept)))
}

/// Messages describing a complete result set.
pub fn result_messages(result: ResultSet) -> Vec<BackendMessage> {
    let tag = format!("SELECT {}", result.rows.len());
    let mut messages = Vec::with_capacity(result.rows.len() + 2);

    messages.push(BackendMessage::RowDescription(result.row_description));
    messages.extend(result.rows.into_iter().map(BackendMessage::DataRow));
    messages.push(BackendMessage::CommandComplete(tag));

    messages
}

/// Encode messages back to back.
pub fn encode_all(messages: &[BackendMessage]) -> Result<Bytes, RouterError> {
    let mut buf = BytesMut::new();
    for message in messages {
        message.encode(&mut buf)?;
    }
    Ok(buf.freeze())
}
