use std::io::Write;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

#[derive(Error, Debug, PartialEq)]
pub enum InputError {
    #[error("invalid amount {0:?}")]
    InvalidAmount(String),
}

/// Parse a transfer amount. Surrounding whitespace is ignored; NaN and
/// infinities are rejected.
pub fn parse_amount(raw: &str) -> Result<f64, InputError> {
    match raw.trim().parse::<f64>() {
        Ok(amount) if amount.is_finite() => Ok(amount),
        _ => Err(InputError::InvalidAmount(raw.to_string())),
    }
}

pub fn is_done(sender: &str) -> bool {
    sender.trim().eq_ignore_ascii_case("done")
}

/// Line-oriented prompts over stdin.
pub struct Prompter {
    lines: Lines<BufReader<Stdin>>,
}

impl Prompter {
    pub fn stdin() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Print `message` and read one line. `None` at end of input or on
    /// Ctrl-C, both of which end the session.
    pub async fn ask(&mut self, message: &str) -> std::io::Result<Option<String>> {
        print!("{message}");
        std::io::stdout().flush()?;
        tokio::select! {
            line = self.lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                Ok(None)
            }
        }
    }
}
