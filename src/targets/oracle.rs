use oracle::sql_type::OracleType;
use oracle::SqlValue;
use oracle::Connection;
use serde_json::{Number, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::TargetError;
use crate::result::CommandResult;
use crate::targets::target::Target;
use crate::targets::{TargetDescriptor, TargetKind};

/// Oracle database target
///
/// The driver is blocking, so every call runs on tokio's blocking pool.
pub struct OracleTarget {
    descriptor: TargetDescriptor,
    connection: Option<Arc<Mutex<Connection>>>,
}

impl OracleTarget {
    pub fn new(descriptor: TargetDescriptor) -> Self {
        Self {
            descriptor,
            connection: None,
        }
    }

    /// TNS descriptor with `database` used as the SID
    fn connect_string(&self) -> String {
        format!(
            "(DESCRIPTION=(ADDRESS=(PROTOCOL=TCP)(HOST={})(PORT={}))(CONNECT_DATA=(SID={})))",
            self.descriptor.host,
            self.descriptor.port,
            self.descriptor.database.as_deref().unwrap_or_default()
        )
    }
}

/// NUMBER columns: integers that fit 64 bits become numbers, everything else keeps its exact text
fn number_to_value(text: String) -> Value {
    if let Ok(n) = text.parse::<i64>() {
        return Value::from(n);
    }
    match text.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(text),
    }
}

/// BINARY_FLOAT and BINARY_DOUBLE are IEEE values already, so f64 loses nothing
fn binary_float_to_value(text: String) -> Value {
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::String(text))
}

fn cell_to_value(value: &SqlValue) -> oracle::Result<Value> {
    if value.is_null()? {
        return Ok(Value::Null);
    }
    let oracle_type = value.oracle_type()?.clone();
    let text: String = value.get()?;
    Ok(match oracle_type {
        OracleType::Number(..) | OracleType::Float(_) | OracleType::Int64 | OracleType::UInt64 => {
            number_to_value(text)
        }
        OracleType::BinaryFloat | OracleType::BinaryDouble => binary_float_to_value(text),
        _ => Value::String(text),
    })
}

/// Run one statement. Queries return their rows; anything else is executed
/// and committed and yields no rows.
fn run_statement(connection: &Connection, sql: &str) -> oracle::Result<Vec<Vec<Value>>> {
    let mut statement = connection.statement(sql).build()?;
    if statement.is_query() {
        let mut rows = Vec::new();
        for row in statement.query(&[])? {
            let row = row?;
            rows.push(
                row.sql_values()
                    .iter()
                    .map(cell_to_value)
                    .collect::<oracle::Result<Vec<_>>>()?,
            );
        }
        Ok(rows)
    } else {
        statement.execute(&[])?;
        connection.commit()?;
        Ok(Vec::new())
    }
}

#[async_trait::async_trait]
impl Target for OracleTarget {
    async fn connect(&mut self) -> Result<(), TargetError> {
        let kind = TargetKind::Oracle;
        info!(
            "Connecting to Oracle at {} as {}",
            self.descriptor.address(),
            self.descriptor.user
        );

        let user = self.descriptor.user.clone();
        let password = self.descriptor.password.clone();
        let connect_string = self.connect_string();

        let connection = tokio::task::spawn_blocking(move || {
            Connection::connect(user, password, connect_string)
        })
        .await
        .map_err(|e| TargetError::connection(kind, e))?
        .map_err(|e| TargetError::connection(kind, e))?;

        info!("Successfully connected to Oracle");
        self.connection = Some(Arc::new(Mutex::new(connection)));
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, TargetError> {
        let kind = TargetKind::Oracle;
        let connection = self
            .connection
            .clone()
            .ok_or(TargetError::NotConnected(kind))?;

        debug!("Executing on Oracle {}: {}", self.descriptor.address(), command);

        let sql = command.to_string();
        let rows = tokio::task::spawn_blocking(move || {
            let connection = connection
                .lock()
                .map_err(|_| TargetError::execution(kind, "connection lock poisoned"))?;
            run_statement(&connection, &sql).map_err(|e| TargetError::execution(kind, e))
        })
        .await
        .map_err(|e| TargetError::execution(kind, e))??;

        debug!("Oracle returned {} row(s)", rows.len());
        Ok(CommandResult::table(None, rows))
    }

    fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    fn target_type(&self) -> &'static str {
        "oracle"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> OracleTarget {
        OracleTarget::new(
            TargetDescriptor::new(TargetKind::Oracle, "10.0.0.5", "scott", "tiger")
                .with_port(1522)
                .with_database("orcl"),
        )
    }

    #[test]
    fn test_connect_string_uses_sid() {
        assert_eq!(
            target().connect_string(),
            "(DESCRIPTION=(ADDRESS=(PROTOCOL=TCP)(HOST=10.0.0.5)(PORT=1522))(CONNECT_DATA=(SID=orcl)))"
        );
    }

    #[test]
    fn test_number_conversion() {
        assert_eq!(number_to_value("42".to_string()), json!(42));
        assert_eq!(number_to_value("-7".to_string()), json!(-7));
        // Fractions and values beyond i64 keep their exact digits
        assert_eq!(number_to_value("-.5".to_string()), json!("-.5"));
        assert_eq!(number_to_value("10.50".to_string()), json!("10.50"));
        assert_eq!(
            number_to_value("1234567890123456789012345".to_string()),
            json!("1234567890123456789012345")
        );
        assert_eq!(binary_float_to_value("2.5".to_string()), json!(2.5));
        assert_eq!(number_to_value("NaN-ish".to_string()), json!("NaN-ish"));
    }

    #[tokio::test]
    async fn test_execute_before_connect() {
        let mut target = target();
        let err = target.execute("SELECT 1 FROM dual").await.unwrap_err();
        assert!(matches!(err, TargetError::NotConnected(TargetKind::Oracle)));
    }
}
