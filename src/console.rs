use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::services::sessions::SessionRegistry;

/// A customer number must look like E.164: leading `+` and at least 10 characters.
pub fn valid_phone(s: &str) -> bool {
    s.starts_with('+') && s.len() >= 10 && s[1..].chars().all(|c| c.is_ascii_digit())
}

/// Console transport: asks for the caller's number, then feeds each input line to the
/// session until it ends or input runs out.
pub async fn run<R, W>(registry: Arc<SessionRegistry>, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = LinesStream::new(input.lines());

    let customer = loop {
        write_line(&mut output, "Enter your phone number (e.g. +16475551234):").await?;
        match lines.next().await {
            Some(line) => {
                let line = line?;
                let candidate = line.trim();
                if valid_phone(candidate) {
                    break candidate.to_string();
                }
                write_line(&mut output, "That doesn't look like a phone number.").await?;
            }
            None => return Ok(()),
        }
    };

    let (id, greeting) = registry.open(&customer);
    write_line(&mut output, &greeting.text).await?;

    while let Some(line) = lines.next().await {
        let line = line?;
        let utterance = line.trim();
        if utterance.is_empty() {
            continue;
        }
        let Some(response) = registry.handle(&id, utterance).await else {
            break;
        };
        write_line(&mut output, &response.text).await?;
        if response.phase.is_terminal() {
            break;
        }
    }

    tracing::info!(session_id = %id, "console session closed");
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> anyhow::Result<()> {
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BusinessProfile;
    use crate::services::audit::TracingAuditLog;
    use crate::services::calendar_store::{CalendarStore, IcsCalendarStore};
    use crate::services::clock::FixedClock;
    use crate::services::conversation::BookingEngine;
    use crate::services::usage::Unmetered;
    use chrono::NaiveDateTime;
    use std::time::Duration;

    #[test]
    fn test_valid_phone() {
        assert!(valid_phone("+16475551234"));
        assert!(!valid_phone("16475551234"));
        assert!(!valid_phone("+1647"));
        assert!(!valid_phone("+1647555abcd"));
    }

    #[tokio::test]
    async fn test_console_books_appointment() {
        let profile = Arc::new(BusinessProfile::default());
        let path = std::env::temp_dir().join(format!("receptionist-{}.ics", uuid::Uuid::new_v4()));
        let store = Arc::new(IcsCalendarStore::open(&path, &profile).unwrap());
        let now = NaiveDateTime::parse_from_str("2024-06-09 10:00", "%Y-%m-%d %H:%M").unwrap();
        let engine = BookingEngine::new(
            profile,
            store.clone(),
            None,
            Arc::new(Unmetered),
            Arc::new(TracingAuditLog),
            Arc::new(FixedClock::new(now)),
            Duration::from_secs(1),
        );
        let registry = Arc::new(SessionRegistry::new(Arc::new(engine)));

        let input: &[u8] = b"555\n+16475551234\noil change tomorrow at 2\nyes\nthis line is never read\n";
        let mut output = Vec::new();
        run(registry, input, &mut output).await.unwrap();

        let transcript = String::from_utf8(output).unwrap();
        assert!(transcript.contains("doesn't look like a phone number"));
        assert!(transcript.contains("Just to confirm"));
        assert_eq!(store.list_all().unwrap().len(), 1);
    }
}
