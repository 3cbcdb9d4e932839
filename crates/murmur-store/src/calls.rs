//! Call records.

use murmur_core::{now_millis, Call, NewCall};
use murmur_protocol::{CallId, CallStatus, CallType};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension};

use crate::database::{millis_from_sql, millis_to_sql, Database};
use crate::error::Result;

const CALL_COLUMNS: &str =
    "id, initiator_id, receiver_id, call_type, status, created_at, ended_at";

impl Database {
    /// Persist a new call in `pending`.
    pub fn create_call(&self, call: &NewCall) -> Result<Call> {
        let created_at = now_millis();
        self.conn().execute(
            "INSERT INTO calls (initiator_id, receiver_id, call_type, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                call.initiator_id,
                call.receiver_id,
                call.call_type.as_str(),
                CallStatus::Pending.as_str(),
                millis_to_sql(created_at),
            ],
        )?;

        Ok(Call {
            id: self.conn().last_insert_rowid(),
            initiator_id: call.initiator_id,
            receiver_id: call.receiver_id,
            call_type: call.call_type,
            status: CallStatus::Pending,
            created_at,
            ended_at: None,
        })
    }

    pub fn get_call(&self, call_id: CallId) -> Result<Option<Call>> {
        let call = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM calls WHERE id = ?1", CALL_COLUMNS),
                params![call_id],
                row_to_call,
            )
            .optional()?;
        Ok(call)
    }

    /// Compare-and-set the status of a call.
    ///
    /// The row is updated only if its status is one of `expected`. `ended_at`
    /// is written only if the row has none.
    pub fn transition_call(
        &self,
        call_id: CallId,
        expected: &[CallStatus],
        next: CallStatus,
        ended_at: Option<u64>,
    ) -> Result<Option<Call>> {
        if expected.is_empty() {
            return Ok(None);
        }

        let placeholders = (0..expected.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE calls SET status = ?1, ended_at = COALESCE(ended_at, ?2)
             WHERE id = ?3 AND status IN ({})",
            placeholders
        );

        let mut values = vec![
            Value::Text(next.as_str().to_string()),
            ended_at.map_or(Value::Null, |t| Value::Integer(millis_to_sql(t))),
            Value::Integer(call_id),
        ];
        values.extend(expected.iter().map(|s| Value::Text(s.as_str().to_string())));

        let updated = self.conn().execute(&sql, params_from_iter(values.iter()))?;
        if updated == 0 {
            tracing::debug!(call = call_id, next = %next, "call transition lost");
            return Ok(None);
        }

        self.get_call(call_id)
    }
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<Call> {
    let call_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    let ended_at: Option<i64> = row.get(6)?;

    Ok(Call {
        id: row.get(0)?,
        initiator_id: row.get(1)?,
        receiver_id: row.get(2)?,
        call_type: CallType::try_from(call_type.as_str())
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?,
        status: CallStatus::try_from(status.as_str())
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?,
        created_at: millis_from_sql(row.get(5)?),
        ended_at: ended_at.map(millis_from_sql),
    })
}
