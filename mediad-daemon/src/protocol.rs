use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON newline-delimited request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Value::Null,
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one JSON request to the request server and return one response.
pub fn send_request(addr: SocketAddr, request: &Request) -> Result<Response, DaemonError> {
    let context = addr.to_string();
    let mut stream = TcpStream::connect_timeout(&addr, CLIENT_TIMEOUT).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::NotRunning { addr }
        } else {
            io_err(&context, err)
        }
    })?;
    stream
        .set_read_timeout(Some(CLIENT_TIMEOUT))
        .map_err(|e| io_err(&context, e))?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&context, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&context, e))?;
    stream.flush().map_err(|e| io_err(&context, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&context, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "server closed connection before responding".to_string(),
        ));
    }

    let response: Response = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

pub fn ping(addr: SocketAddr) -> Result<(), DaemonError> {
    send_request(addr, &Request::new("ping")).and_then(response_into_data)?;
    Ok(())
}

pub fn request_status(addr: SocketAddr) -> Result<Value, DaemonError> {
    send_request(addr, &Request::new("status")).and_then(response_into_data)
}

fn response_into_data(response: Response) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown server error".to_string()),
        ))
    }
}
