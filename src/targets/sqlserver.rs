use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Number, Value};
use tiberius::{AuthMethod, Client, ColumnData, Config, FromSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use crate::error::TargetError;
use crate::result::CommandResult;
use crate::targets::target::Target;
use crate::targets::{hex_bytes, TargetDescriptor, TargetKind};

/// Microsoft SQL Server target (TDS over TCP)
pub struct SqlServerTarget {
    descriptor: TargetDescriptor,
    client: Option<Client<Compat<TcpStream>>>,
}

impl SqlServerTarget {
    pub fn new(descriptor: TargetDescriptor) -> Self {
        Self {
            descriptor,
            client: None,
        }
    }

    fn client_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.descriptor.host);
        config.port(self.descriptor.port);
        if let Some(ref database) = self.descriptor.database {
            config.database(database);
        }
        config.authentication(AuthMethod::sql_server(
            &self.descriptor.user,
            &self.descriptor.password,
        ));
        // Server certificates are not verified
        config.trust_cert();
        config
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

fn temporal<T, F>(data: &ColumnData<'static>, render: F) -> Value
where
    T: for<'a> FromSql<'a>,
    F: FnOnce(T) -> String,
{
    match T::from_sql(data) {
        Ok(Some(value)) => Value::String(render(value)),
        Ok(None) => Value::Null,
        Err(_) => Value::String(format!("{:?}", data)),
    }
}

/// Convert one TDS cell into a JSON value
fn column_to_json(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|f| float_value(f as f64)).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(float_value).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v
            .as_ref()
            .map(|g| Value::String(g.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::String(hex_bytes(b)))
            .unwrap_or(Value::Null),
        // Kept as text so no precision is lost
        ColumnData::Numeric(v) => v
            .as_ref()
            .map(|n| Value::String(n.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal(data, |dt: NaiveDateTime| dt.to_string())
        }
        ColumnData::Date(_) => temporal(data, |d: NaiveDate| d.to_string()),
        ColumnData::Time(_) => temporal(data, |t: NaiveTime| t.to_string()),
        ColumnData::DateTimeOffset(_) => temporal(data, |dt: DateTime<Utc>| dt.to_rfc3339()),
        other => Value::String(format!("{:?}", other)),
    }
}

#[async_trait::async_trait]
impl Target for SqlServerTarget {
    async fn connect(&mut self) -> Result<(), TargetError> {
        let kind = TargetKind::SqlServer;
        info!(
            "Connecting to SQL Server at {} as {}",
            self.descriptor.address(),
            self.descriptor.user
        );

        let config = self.client_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| TargetError::connection(kind, e))?;
        tcp.set_nodelay(true)
            .map_err(|e| TargetError::connection(kind, e))?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| TargetError::connection(kind, e))?;

        info!("Successfully connected to SQL Server");
        self.client = Some(client);
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, TargetError> {
        let kind = TargetKind::SqlServer;
        let client = self
            .client
            .as_mut()
            .ok_or(TargetError::NotConnected(kind))?;

        debug!("Executing on SQL Server {}: {}", self.descriptor.address(), command);

        let results = client
            .simple_query(command)
            .await
            .map_err(|e| TargetError::execution(kind, e))?
            .into_results()
            .await
            .map_err(|e| TargetError::execution(kind, e))?;

        // Only the first result set is reported
        let rows: Vec<Vec<Value>> = results
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|row| row.into_iter().map(|cell| column_to_json(&cell)).collect())
            .collect();

        debug!("SQL Server returned {} row(s)", rows.len());
        Ok(CommandResult::table(None, rows))
    }

    fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    fn target_type(&self) -> &'static str {
        "sqlserver"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::borrow::Cow;
    use tiberius::IntoSql;

    #[test]
    fn test_scalar_columns() {
        assert_eq!(column_to_json(&ColumnData::I32(Some(5))), json!(5));
        assert_eq!(column_to_json(&ColumnData::I64(None)), Value::Null);
        assert_eq!(column_to_json(&ColumnData::Bit(Some(true))), json!(true));
        assert_eq!(column_to_json(&ColumnData::F64(Some(1.25))), json!(1.25));
        assert_eq!(
            column_to_json(&ColumnData::String(Some(Cow::from("abc")))),
            json!("abc")
        );
    }

    #[test]
    fn test_binary_column_is_hex() {
        let data = ColumnData::Binary(Some(Cow::from(vec![0x0a, 0xff])));
        assert_eq!(column_to_json(&data), json!("0x0aff"));
    }

    #[test]
    fn test_datetime_column() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 31)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let data: ColumnData<'static> = dt.into_sql();
        assert_eq!(column_to_json(&data), json!("2024-01-31 10:00:00"));
    }

    #[test]
    fn test_client_config_address() {
        let target = SqlServerTarget::new(
            TargetDescriptor::new(TargetKind::SqlServer, "db.local", "sa", "pw")
                .with_database("master"),
        );
        assert_eq!(target.client_config().get_addr(), "db.local:1433");
    }

    #[tokio::test]
    async fn test_execute_before_connect() {
        let descriptor =
            TargetDescriptor::new(TargetKind::SqlServer, "h", "sa", "p").with_database("master");
        let mut target = SqlServerTarget::new(descriptor);
        let err = target.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, TargetError::NotConnected(TargetKind::SqlServer)));
    }
}
