use std::time::Duration;

use crate::error::Error;
use crate::types::CompletionCode;

/// Record a dispatched command. `mode` distinguishes the LAN path
/// (`"udp"`) from the VM transport (`"vm"`).
pub(crate) fn record_command(
    mode: &'static str,
    netfn: u8,
    cmd: u8,
    elapsed: Duration,
    code: CompletionCode,
) {
    tracing::debug!(
        mode,
        netfn,
        cmd,
        completion_code = code.as_u8(),
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "ipmi command handled"
    );

    #[cfg(feature = "metrics")]
    {
        metrics::counter!("ipmi_commands_total", "mode" => mode).increment(1);
        metrics::histogram!("ipmi_command_seconds", "mode" => mode).record(elapsed.as_secs_f64());
        if code != CompletionCode::Ok {
            metrics::counter!("ipmi_completion_code_nonzero_total", "mode" => mode).increment(1);
        }
    }
}

/// Record a request that never reached a handler (malformed wire input,
/// integrity failure, and the like).
pub(crate) fn record_dropped(mode: &'static str, err: &Error) {
    tracing::warn!(mode, error = %err, "ipmi request dropped");

    #[cfg(feature = "metrics")]
    metrics::counter!(
        "ipmi_requests_dropped_total",
        "mode" => mode,
        "kind" => error_kind(err)
    )
    .increment(1);
}

#[cfg(feature = "metrics")]
fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::Io(_) => "io",
        Error::Protocol(_) | Error::ProtocolOwned(_) => "protocol",
        Error::AuthenticationFailed(_) => "authentication",
        Error::Crypto(_) => "crypto",
        Error::Unsupported(_) => "unsupported",
    }
}
