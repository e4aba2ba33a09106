//! Remove command handler

use std::io::{self, Write};

use anyhow::Result;
use sugar_core::{Stack, StackConfig};

use crate::output::Output;

/// Delete the primary store file
pub fn run(config: StackConfig, force: bool, output: &Output) -> Result<()> {
    let stack = Stack::new(config, None);

    if !force && output.should_prompt() {
        let target = stack
            .store_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(no path configured)".to_string());
        print!("Delete {}? All data in it is lost. [y/N] ", target);
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    stack.remove_database()?;
    output.success("Store removed");
    Ok(())
}
