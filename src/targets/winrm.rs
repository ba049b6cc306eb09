use anyhow::{Context, Result};
use base64::Engine;
use encoding_rs::Encoding;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WinRmConfig;
use crate::error::TargetError;
use crate::result::CommandResult;
use crate::targets::target::Target;
use crate::targets::{TargetDescriptor, TargetKind};

const RESOURCE_URI_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const COMMAND_STATE_DONE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

/// WSManFault code returned when a Receive hits the operation timeout with no output
const RECEIVE_TIMEOUT_FAULT: &str = "2150858793";

/// SOAP fault reported by the WinRM service
#[derive(Debug, Error)]
#[error("WinRM fault {}: {reason}", .code.as_deref().unwrap_or("unknown"))]
struct SoapFault {
    code: Option<String>,
    reason: String,
}

impl SoapFault {
    fn is_receive_timeout(&self) -> bool {
        self.code.as_deref() == Some(RECEIVE_TIMEOUT_FAULT)
    }
}

/// Fields of interest extracted from a WS-Management response
#[derive(Debug, Default)]
struct SoapResponse {
    shell_id: Option<String>,
    command_id: Option<String>,
    /// (stream name, decoded bytes) in document order
    streams: Vec<(String, Vec<u8>)>,
    done: bool,
    exit_code: Option<i64>,
    fault_code: Option<String>,
    fault_reason: Option<String>,
}

impl SoapResponse {
    fn into_fault(self) -> Option<SoapFault> {
        if self.fault_code.is_none() && self.fault_reason.is_none() {
            return None;
        }
        Some(SoapFault {
            code: self.fault_code,
            reason: self.fault_reason.unwrap_or_else(|| "unknown fault".to_string()),
        })
    }
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.context("Malformed XML attribute")?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn parse_response(xml: &str) -> Result<SoapResponse> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut response = SoapResponse::default();
    let mut path: Vec<String> = Vec::new();
    let mut stream_name: Option<String> = None;
    let mut in_shell_selector = false;

    loop {
        match reader.read_event().context("Malformed WinRM response")? {
            Event::Start(element) => {
                let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "Stream" => stream_name = attribute(&element, b"Name")?,
                    "Selector" => {
                        in_shell_selector =
                            attribute(&element, b"Name")?.as_deref() == Some("ShellId")
                    }
                    "CommandState" => {
                        if attribute(&element, b"State")?.as_deref() == Some(COMMAND_STATE_DONE) {
                            response.done = true;
                        }
                    }
                    "WSManFault" => response.fault_code = attribute(&element, b"Code")?,
                    _ => {}
                }
                path.push(name);
            }
            Event::Empty(element) => match element.local_name().as_ref() {
                b"CommandState" => {
                    if attribute(&element, b"State")?.as_deref() == Some(COMMAND_STATE_DONE) {
                        response.done = true;
                    }
                }
                b"WSManFault" => response.fault_code = attribute(&element, b"Code")?,
                _ => {}
            },
            Event::Text(text) => {
                let text = text.unescape()?.into_owned();
                match path.last().map(String::as_str) {
                    Some("ShellId") => {
                        response.shell_id.get_or_insert(text);
                    }
                    Some("Selector") if in_shell_selector => {
                        response.shell_id.get_or_insert(text);
                    }
                    Some("CommandId") => response.command_id = Some(text),
                    Some("Stream") => {
                        let bytes = base64::engine::general_purpose::STANDARD
                            .decode(text.as_bytes())
                            .context("Invalid base64 in WinRM output stream")?;
                        let name = stream_name.clone().unwrap_or_else(|| "stdout".to_string());
                        response.streams.push((name, bytes));
                    }
                    Some("ExitCode") => response.exit_code = text.parse().ok(),
                    Some("Text") if path.iter().any(|p| p == "Reason") => {
                        response.fault_reason = Some(text)
                    }
                    Some("Message") if response.fault_reason.is_none() => {
                        response.fault_reason = Some(text)
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                if path.pop().as_deref() == Some("Selector") {
                    in_shell_selector = false;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(response)
}

/// Accumulated output of one remote command
#[derive(Debug, Default)]
struct CommandOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i64>,
}

/// Minimal WS-Management client for the Windows `cmd` shell
struct WinRmClient {
    client: Client,
    endpoint: String,
    user: String,
    password: String,
    codepage: u32,
    operation_timeout_seconds: u64,
}

impl WinRmClient {
    fn new(endpoint: String, user: &str, password: &str, config: &WinRmConfig) -> Result<Self> {
        // Leave the server room to answer a Receive that ran into its own timeout
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.operation_timeout_seconds + 10,
            ))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            user: user.to_string(),
            password: password.to_string(),
            codepage: config.codepage,
            operation_timeout_seconds: config.operation_timeout_seconds,
        })
    }

    fn envelope(
        &self,
        action: &str,
        shell_id: Option<&str>,
        options: &[(&str, String)],
        body: &str,
    ) -> String {
        let mut extra_headers = String::new();
        if let Some(shell_id) = shell_id {
            extra_headers.push_str(&format!(
                "<w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>",
                escape(shell_id)
            ));
        }
        if !options.is_empty() {
            extra_headers.push_str("<w:OptionSet>");
            for (name, value) in options {
                extra_headers.push_str(&format!(
                    "<w:Option Name=\"{}\">{}</w:Option>",
                    name,
                    escape(value.as_str())
                ));
            }
            extra_headers.push_str("</w:OptionSet>");
        }

        let endpoint = escape(self.endpoint.as_str());
        let message_id = uuid::Uuid::new_v4();
        let timeout = self.operation_timeout_seconds;

        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
<env:Header>
<a:To>{endpoint}</a:To>
<a:ReplyTo><a:Address mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>
<w:MaxEnvelopeSize mustUnderstand="true">153600</w:MaxEnvelopeSize>
<a:MessageID>uuid:{message_id}</a:MessageID>
<w:Locale xml:lang="en-US" mustUnderstand="false"/>
<p:DataLocale xml:lang="en-US" mustUnderstand="false"/>
<w:OperationTimeout>PT{timeout}S</w:OperationTimeout>
<w:ResourceURI mustUnderstand="true">{RESOURCE_URI_CMD}</w:ResourceURI>
<a:Action mustUnderstand="true">{action}</a:Action>
{extra_headers}
</env:Header>
<env:Body>{body}</env:Body>
</env:Envelope>"#
        )
    }

    async fn send(&self, envelope: String) -> Result<SoapResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
            .context("Failed to send WinRM request")?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            anyhow::bail!("WinRM rejected the credentials (401 Unauthorized)");
        }
        let body = response
            .text()
            .await
            .context("Failed to read WinRM response")?;
        if status.is_success() {
            return parse_response(&body);
        }

        // WS-Management reports faults as 500 with a SOAP body
        if let Ok(parsed) = parse_response(&body) {
            if let Some(fault) = parsed.into_fault() {
                return Err(fault.into());
            }
        }
        anyhow::bail!("WinRM request failed with status {}: {}", status, body)
    }

    async fn open_shell(&self) -> Result<String> {
        let options = [
            ("WINRS_NOPROFILE", "FALSE".to_string()),
            ("WINRS_CODEPAGE", self.codepage.to_string()),
        ];
        let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";

        let response = self
            .send(self.envelope(ACTION_CREATE, None, &options, body))
            .await?;
        response
            .shell_id
            .context("WinRM create response did not contain a ShellId")
    }

    async fn run_command(&self, shell_id: &str, command: &str) -> Result<String> {
        let options = [
            ("WINRS_CONSOLEMODE_STDIN", "TRUE".to_string()),
            ("WINRS_SKIP_CMD_SHELL", "FALSE".to_string()),
        ];
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            escape(command)
        );

        let response = self
            .send(self.envelope(ACTION_COMMAND, Some(shell_id), &options, &body))
            .await?;
        response
            .command_id
            .context("WinRM command response did not contain a CommandId")
    }

    async fn receive_output(&self, shell_id: &str, command_id: &str) -> Result<CommandOutput> {
        let body = format!(
            "<rsp:Receive><rsp:DesiredStream CommandId=\"{}\">stdout stderr</rsp:DesiredStream></rsp:Receive>",
            escape(command_id)
        );
        let mut output = CommandOutput::default();

        loop {
            let response = match self
                .send(self.envelope(ACTION_RECEIVE, Some(shell_id), &[], &body))
                .await
            {
                Ok(response) => response,
                Err(e) if e.downcast_ref::<SoapFault>().is_some_and(SoapFault::is_receive_timeout) => {
                    debug!("No output yet for command {}, polling again", command_id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            for (name, bytes) in response.streams {
                match name.as_str() {
                    "stderr" => output.stderr.extend_from_slice(&bytes),
                    _ => output.stdout.extend_from_slice(&bytes),
                }
            }

            if response.done {
                output.exit_code = response.exit_code;
                return Ok(output);
            }
        }
    }

    async fn signal_terminate(&self, shell_id: &str, command_id: &str) -> Result<()> {
        let body = format!(
            "<rsp:Signal CommandId=\"{}\"><rsp:Code>{}</rsp:Code></rsp:Signal>",
            escape(command_id),
            SIGNAL_TERMINATE
        );
        self.send(self.envelope(ACTION_SIGNAL, Some(shell_id), &[], &body))
            .await?;
        Ok(())
    }

    async fn close_shell(&self, shell_id: &str) -> Result<()> {
        self.send(self.envelope(ACTION_DELETE, Some(shell_id), &[], ""))
            .await?;
        Ok(())
    }
}

struct WinRmSession {
    client: WinRmClient,
    shell_id: String,
}

/// Windows host reached over WinRM (basic auth, plaintext HTTP)
///
/// Credentials and output travel unencrypted. Use only on trusted networks.
pub struct WinRmTarget {
    descriptor: TargetDescriptor,
    config: WinRmConfig,
    encoding: &'static Encoding,
    session: Option<WinRmSession>,
}

impl WinRmTarget {
    pub fn new(descriptor: TargetDescriptor, config: &WinRmConfig) -> Self {
        let encoding = Encoding::for_label(config.output_encoding.as_bytes()).unwrap_or_else(|| {
            warn!(
                "Unknown output encoding '{}', falling back to windows-1252",
                config.output_encoding
            );
            encoding_rs::WINDOWS_1252
        });

        Self {
            descriptor,
            config: config.clone(),
            encoding,
            session: None,
        }
    }

    /// Build the WS-Management endpoint URL
    pub(crate) fn endpoint(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.descriptor.host,
            self.descriptor.port,
            self.config.service_path.trim_start_matches('/')
        )
    }

    fn decode(&self, bytes: &[u8]) -> String {
        self.encoding
            .decode_without_bom_handling(bytes)
            .0
            .into_owned()
    }
}

#[async_trait::async_trait]
impl Target for WinRmTarget {
    async fn connect(&mut self) -> Result<(), TargetError> {
        let kind = TargetKind::Windows;
        let endpoint = self.endpoint();
        info!("Opening WinRM shell at {} as {}", endpoint, self.descriptor.user);

        let client = WinRmClient::new(
            endpoint,
            &self.descriptor.user,
            &self.descriptor.password,
            &self.config,
        )
        .map_err(|e| TargetError::connection(kind, format!("{:#}", e)))?;

        let shell_id = client
            .open_shell()
            .await
            .map_err(|e| TargetError::connection(kind, format!("{:#}", e)))?;

        debug!("Opened WinRM shell {}", shell_id);
        self.session = Some(WinRmSession { client, shell_id });
        Ok(())
    }

    /// Runs the command and closes the remote shell; the session is used up afterwards.
    async fn execute(&mut self, command: &str) -> Result<CommandResult, TargetError> {
        let kind = TargetKind::Windows;
        let WinRmSession { client, shell_id } =
            self.session.take().ok_or(TargetError::NotConnected(kind))?;

        debug!("Executing on {}: {}", self.descriptor.address(), command);

        let command_id = match client.run_command(&shell_id, command).await {
            Ok(command_id) => command_id,
            Err(e) => {
                if let Err(close_err) = client.close_shell(&shell_id).await {
                    warn!("Failed to close WinRM shell {}: {}", shell_id, close_err);
                }
                return Err(TargetError::execution(kind, format!("{:#}", e)));
            }
        };

        let output = client.receive_output(&shell_id, &command_id).await;

        if let Err(e) = client.signal_terminate(&shell_id, &command_id).await {
            warn!("Failed to terminate WinRM command {}: {}", command_id, e);
        }
        if let Err(e) = client.close_shell(&shell_id).await {
            warn!("Failed to close WinRM shell {}: {}", shell_id, e);
        }

        let output = output.map_err(|e| TargetError::execution(kind, format!("{:#}", e)))?;

        if !output.stderr.is_empty() {
            warn!(
                "stderr from {}: {}",
                self.descriptor.address(),
                self.decode(&output.stderr).trim_end()
            );
        }
        if let Some(code) = output.exit_code.filter(|code| *code != 0) {
            warn!(
                "Command on {} exited with status {}",
                self.descriptor.address(),
                code
            );
        }

        Ok(CommandResult::text(self.decode(&output.stdout)))
    }

    fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    fn target_type(&self) -> &'static str {
        "winrm"
    }
}
