//! Interactive accept/decline prompt for incoming transfers.

use async_trait::async_trait;
use fsync_core::{Confirm, ConfirmError, TransferOffer};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::Mutex;

use crate::progress::format_bytes;

/// Asks on a line-oriented terminal; re-prompts until `y` or `n`.
pub struct PromptConfirmer<R, W> {
    io: Mutex<(BufReader<R>, W)>,
}

impl PromptConfirmer<Stdin, Stdout> {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> PromptConfirmer<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((BufReader::new(input), output)),
        }
    }
}

/// The summary printed before asking.
pub fn describe_offer(offer: &TransferOffer<'_>) -> String {
    let mut text = format!(
        "Peer wants to send {} file(s), {} total:\n",
        offer.files.len(),
        format_bytes(offer.total_size)
    );
    for file in offer.files {
        text.push_str(&format!("  {} ({})\n", file.name, format_bytes(file.size)));
    }
    text
}

fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl<R, W> Confirm for PromptConfirmer<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn confirm(&self, offer: &TransferOffer<'_>) -> Result<bool, ConfirmError> {
        let mut guard = self.io.lock().await;
        let (input, output) = &mut *guard;

        output.write_all(describe_offer(offer).as_bytes()).await?;
        loop {
            output.write_all(b"Accept? [y/n] ").await?;
            output.flush().await?;

            let mut line = String::new();
            if input.read_line(&mut line).await? == 0 {
                return Err(ConfirmError::InputClosed);
            }
            if let Some(answer) = parse_answer(&line) {
                return Ok(answer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsync_core::{ContentHash, FileFingerprint};

    fn files() -> Vec<FileFingerprint> {
        vec![
            FileFingerprint {
                name: "x.txt".into(),
                content_hash: ContentHash::of(b"hello"),
                size: 5,
            },
            FileFingerprint {
                name: "big.bin".into(),
                content_hash: ContentHash::of(b"big"),
                size: 2048,
            },
        ]
    }

    async fn ask(input: &'static [u8]) -> (Result<bool, ConfirmError>, String) {
        let files = files();
        let offer = TransferOffer {
            files: &files,
            total_size: 2053,
        };
        let confirmer = PromptConfirmer::new(input, Vec::new());
        let result = confirmer.confirm(&offer).await;
        let (_, output) = confirmer.io.into_inner();
        (result, String::from_utf8(output).unwrap())
    }

    #[tokio::test]
    async fn test_yes() {
        let (result, output) = ask(b"y\n").await;
        assert!(result.unwrap());
        assert!(output.contains("2 file(s), 2.0 KiB total"));
        assert!(output.contains("  x.txt (5 B)"));
        assert!(output.contains("  big.bin (2.0 KiB)"));
    }

    #[tokio::test]
    async fn test_no() {
        let (result, _) = ask(b"NO\n").await;
        assert!(!result.unwrap());
    }

    #[tokio::test]
    async fn test_reprompts_until_valid() {
        let (result, output) = ask(b"maybe\n\nyes\n").await;
        assert!(result.unwrap());
        assert_eq!(output.matches("Accept? [y/n]").count(), 3);
    }

    #[tokio::test]
    async fn test_closed_input() {
        let (result, _) = ask(b"").await;
        assert!(matches!(result, Err(ConfirmError::InputClosed)));
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer(" Y \n"), Some(true));
        assert_eq!(parse_answer("n"), Some(false));
        assert_eq!(parse_answer("sure"), None);
    }
}
