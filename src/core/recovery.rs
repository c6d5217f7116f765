//! 错误归类
//!
//! 将 reqwest / WebSocket / HTTP 状态码映射为 ServiceError，供执行器判断是否重试。

use reqwest::StatusCode;

use crate::core::ServiceError;

/// reqwest 传输层错误 → ServiceError
pub fn classify_reqwest(err: &reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        ServiceError::Network(err.to_string())
    } else if err.is_decode() || err.is_builder() {
        ServiceError::Validation(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status, &err.to_string())
    } else {
        ServiceError::Unknown(err.to_string())
    }
}

/// 非 2xx 状态码一律视为失败；5xx / 429 属于服务端暂时不可用
pub fn classify_status(status: StatusCode, body: &str) -> ServiceError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ServiceError::Timeout(detail),
        StatusCode::TOO_MANY_REQUESTS => ServiceError::Network(detail),
        s if s.is_server_error() => ServiceError::Network(detail),
        s if s.is_client_error() => ServiceError::Validation(detail),
        _ => ServiceError::Unknown(detail),
    }
}

/// WebSocket 握手 / 读写错误
pub fn classify_ws(err: &tokio_tungstenite::tungstenite::Error) -> ServiceError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            ServiceError::Timeout(e.to_string())
        }
        WsError::Io(e) => ServiceError::Network(e.to_string()),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            ServiceError::Network(err.to_string())
        }
        WsError::Url(_) | WsError::HttpFormat(_) => ServiceError::Validation(err.to_string()),
        WsError::Http(resp) => classify_status(resp.status(), "websocket handshake rejected"),
        _ => ServiceError::Unknown(err.to_string()),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    #[test]
    fn test_server_errors_are_retryable() {
        let err = classify_status(StatusCode::SERVICE_UNAVAILABLE, "down");
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_errors_are_validation() {
        let err = classify_status(StatusCode::BAD_REQUEST, "missing project_name");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn test_timeouts() {
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, "").kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "").kind(),
            ErrorKind::Network
        );
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
