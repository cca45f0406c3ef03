//! Interactive shell for `bql shell`
//!
//! Statements may span lines and run once a line ends with `;`.

use std::io::{BufRead, Write};

use bql_engine::Engine;

const PROMPT: &str = "bql> ";
const CONTINUATION: &str = "...> ";

fn is_quit(line: &str) -> bool {
    matches!(
        line.trim().trim_end_matches(';').to_ascii_lowercase().as_str(),
        "quit" | "exit" | "\\q"
    )
}

/// Read statements from `input` until EOF or `quit`, writing results to `output`.
pub fn repl<R: BufRead, W: Write>(engine: &mut Engine, input: R, mut output: W) -> std::io::Result<()> {
    let mut buffer = String::new();
    write!(output, "{PROMPT}")?;
    output.flush()?;

    for line in input.lines() {
        let line = line?;
        if buffer.is_empty() && is_quit(&line) {
            return Ok(());
        }
        buffer.push_str(&line);
        buffer.push('\n');

        if line.trim_end().ends_with(';') {
            match engine.execute_script(&buffer) {
                Ok(results) => {
                    for result in results {
                        writeln!(output, "{}", result.render())?;
                    }
                }
                Err(e) => writeln!(output, "error: {e}")?,
            }
            buffer.clear();
        }

        let prompt = if buffer.is_empty() { PROMPT } else { CONTINUATION };
        write!(output, "{prompt}")?;
        output.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bql_engine::EngineConfig;

    fn run(input: &str) -> String {
        let mut engine = Engine::in_memory(EngineConfig::default());
        let mut out = Vec::new();
        repl(&mut engine, input.as_bytes(), &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_statements_run_at_semicolon() {
        let out = run("LIST\nBTABLES;\n");
        assert!(out.contains(CONTINUATION));
        assert!(out.contains("(0 rows)"));
    }

    #[test]
    fn test_errors_do_not_end_the_session() {
        let out = run("SELECT * FROM ghost;\nLIST BTABLES;\n");
        assert!(out.contains("error:"));
        assert!(out.contains("(0 rows)"));
    }

    #[test]
    fn test_quit_stops_reading() {
        let out = run("quit\nLIST BTABLES;\n");
        assert!(!out.contains("rows)"));
        assert!(is_quit("EXIT;"));
        assert!(!is_quit("exits"));
    }
}
