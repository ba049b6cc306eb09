use futures::TryStreamExt;
use serde_json::{Number, Value};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Column, ConnectOptions, Either, Executor, Row, TypeInfo, ValueRef};
use tracing::{debug, info, warn};

use crate::error::TargetError;
use crate::result::CommandResult;
use crate::targets::target::Target;
use crate::targets::{hex_bytes, TargetDescriptor, TargetKind};

/// MySQL database target
///
/// Statements go over the text protocol, so any statement the server accepts
/// can be sent, including ones that cannot be prepared. When a command holds
/// several statements only the first result set is returned.
pub struct MySqlTarget {
    descriptor: TargetDescriptor,
    connection: Option<MySqlConnection>,
}

impl MySqlTarget {
    pub fn new(descriptor: TargetDescriptor) -> Self {
        Self {
            descriptor,
            connection: None,
        }
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.descriptor.host)
            .port(self.descriptor.port)
            .username(&self.descriptor.user)
            .password(&self.descriptor.password)
    }
}

/// Convert one text-protocol cell into a JSON value based on its column type
fn text_to_value(type_name: &str, text: String) -> Value {
    let base = type_name.trim_end_matches(" UNSIGNED");
    match base {
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            if let Ok(n) = text.parse::<i64>() {
                return Value::from(n);
            }
            if let Ok(n) = text.parse::<u64>() {
                return Value::from(n);
            }
            Value::String(text)
        }
        "FLOAT" | "DOUBLE" => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(text)),
        "BOOLEAN" => match text.as_str() {
            "0" => Value::Bool(false),
            "1" => Value::Bool(true),
            _ => Value::String(text),
        },
        _ => Value::String(text),
    }
}

/// One text-protocol cell with the type name of its column; `None` is SQL NULL
#[derive(Debug, Clone, PartialEq)]
struct TextCell {
    type_name: String,
    text: Option<String>,
}

impl TextCell {
    fn into_value(self) -> Value {
        match self.text {
            Some(text) => text_to_value(&self.type_name, text),
            None => Value::Null,
        }
    }
}

/// One item of a (possibly multi-statement) response stream
#[derive(Debug, Clone, PartialEq)]
enum Fetched {
    Row {
        columns: Vec<String>,
        cells: Vec<TextCell>,
    },
    /// A statement finished; ends the current result set
    Done,
}

/// Collects the first result set of a response and ignores everything after it
#[derive(Debug, Default)]
struct FirstResultSet {
    columns: Option<Vec<String>>,
    rows: Vec<Vec<TextCell>>,
    complete: bool,
}

impl FirstResultSet {
    /// Feed one item. Returns false once the first result set has ended.
    fn push(&mut self, item: Fetched) -> bool {
        if self.complete {
            return false;
        }
        match item {
            Fetched::Row { columns, cells } => {
                self.columns.get_or_insert(columns);
                self.rows.push(cells);
                true
            }
            Fetched::Done => {
                self.complete = true;
                false
            }
        }
    }

    fn has_columns(&self) -> bool {
        self.columns.is_some()
    }

    /// Build the table, using `described` for the column names when no row arrived
    fn into_table(self, described: Vec<String>) -> Result<CommandResult, String> {
        assemble_table(self.columns.unwrap_or(described), self.rows)
    }
}

/// Turn column names and text cells into a table whose rows all match the column list
fn assemble_table(
    columns: Vec<String>,
    rows: Vec<Vec<TextCell>>,
) -> Result<CommandResult, String> {
    let rows = rows
        .into_iter()
        .enumerate()
        .map(|(index, row)| {
            if row.len() != columns.len() {
                return Err(format!(
                    "row {} has {} cell(s) but the result has {} column(s)",
                    index + 1,
                    row.len(),
                    columns.len()
                ));
            }
            Ok(row.into_iter().map(TextCell::into_value).collect())
        })
        .collect::<Result<Vec<Vec<Value>>, String>>()?;
    Ok(CommandResult::table(Some(columns), rows))
}

fn read_cell(row: &MySqlRow, index: usize) -> Result<TextCell, sqlx::Error> {
    let (is_null, type_name) = {
        let raw = row.try_get_raw(index)?;
        (raw.is_null(), raw.type_info().name().to_string())
    };
    if is_null {
        return Ok(TextCell {
            type_name,
            text: None,
        });
    }

    // Text protocol: every value arrives as its textual representation
    let text = match row.try_get_unchecked::<String, _>(index) {
        Ok(text) => text,
        Err(_) => {
            let bytes: Vec<u8> = row.try_get_unchecked(index)?;
            return Ok(TextCell {
                type_name: "BLOB".to_string(),
                text: Some(hex_bytes(&bytes)),
            });
        }
    };
    Ok(TextCell {
        type_name,
        text: Some(text),
    })
}

fn read_row(row: &MySqlRow) -> Result<Fetched, sqlx::Error> {
    let columns = row.columns().iter().map(|c| c.name().to_string()).collect();
    let cells = (0..row.len())
        .map(|index| read_cell(row, index))
        .collect::<Result<_, _>>()?;
    Ok(Fetched::Row { columns, cells })
}

#[async_trait::async_trait]
impl Target for MySqlTarget {
    async fn connect(&mut self) -> Result<(), TargetError> {
        info!(
            "Connecting to MySQL at {} as {}",
            self.descriptor.address(),
            self.descriptor.user
        );
        if let Some(ref database) = self.descriptor.database {
            warn!("MySQL targets ignore the database parameter ('{}')", database);
        }

        let connection = self
            .connect_options()
            .connect()
            .await
            .map_err(|e| TargetError::connection(TargetKind::MySql, e))?;

        info!("Successfully connected to MySQL");
        self.connection = Some(connection);
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, TargetError> {
        let kind = TargetKind::MySql;
        let connection = self
            .connection
            .as_mut()
            .ok_or(TargetError::NotConnected(kind))?;

        debug!("Executing on MySQL {}: {}", self.descriptor.address(), command);

        let mut set = FirstResultSet::default();
        {
            let mut stream = (&mut *connection).fetch_many(command);
            while let Some(item) = stream
                .try_next()
                .await
                .map_err(|e| TargetError::execution(kind, e))?
            {
                let item = match item {
                    Either::Left(_) => Fetched::Done,
                    Either::Right(row) => {
                        read_row(&row).map_err(|e| TargetError::execution(kind, e))?
                    }
                };
                if !set.push(item) {
                    break;
                }
            }
        }

        // No rows to read names from; ask the server for the statement's metadata
        let described = if set.has_columns() {
            Vec::new()
        } else {
            match (&mut *connection).describe(command).await {
                Ok(describe) => describe
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect(),
                Err(e) => {
                    debug!("Could not describe statement for column names: {}", e);
                    Vec::new()
                }
            }
        };

        debug!("MySQL returned {} row(s)", set.rows.len());
        set.into_table(described).map_err(|e| TargetError::execution(kind, e))
    }

    fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    fn target_type(&self) -> &'static str {
        "mysql"
    }
}
