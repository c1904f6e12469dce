//! CLI Commands

pub mod generate;
pub mod namespaces;
pub mod nodes;
pub mod preauthkeys;

use std::io::{BufRead, Write};

/// Ask a yes/no question on the terminal; anything but y/yes is a no.
pub(crate) fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
