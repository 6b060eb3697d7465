use std::io::{self, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use crate::context::Context;
use crate::error::ShellfsError;
use crate::executable::{Executable, WriteTargets};
use crate::program::{Program, SyncResultProgram, WaitMode};

/// Writes bytes to a file through the command's stdin.
///
/// The data travels as a here-document with a random quoted delimiter, so
/// the shell performs no expansion on it and never reads past it. `head -c`
/// trims the newline the here-document adds after unterminated data.
#[derive(Debug, Clone)]
pub struct WriteFile {
    executable: Executable,
    destination: Utf8PathBuf,
    data: Vec<u8>,
    delimiter: String,
}

impl WriteFile {
    pub fn new(ctx: &Context, destination: &Utf8Path, data: impl Into<Vec<u8>>) -> Result<Arc<Self>, ShellfsError> {
        let data = data.into();
        if data.contains(&0) {
            return Err(ShellfsError::Validation(format!(
                "cannot write NUL bytes through the shell: {}",
                destination
            )));
        }
        let delimiter = format!("SHELLFS_EOF_{}", Uuid::new_v4().simple());
        if data.split(|b| *b == b'\n').any(|line| line == delimiter.as_bytes()) {
            return Err(ShellfsError::Validation(format!(
                "data collides with the here-document delimiter: {}",
                destination
            )));
        }
        let length = data.len().to_string();
        let executable = ctx.build("write", &[length.as_str(), destination.as_str(), delimiter.as_str()])?;
        Ok(Arc::new(Self {
            executable,
            destination: destination.to_owned(),
            data,
            delimiter,
        }))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Program for WriteFile {
    fn executable(&self) -> &Executable {
        &self.executable
    }

    fn wait_mode(&self) -> WaitMode {
        WaitMode::Indefinite
    }

    fn write_targets(&self) -> Option<WriteTargets> {
        Some(WriteTargets::destination(&self.destination))
    }

    fn write_stdin(&self, stdin: &mut dyn Write) -> io::Result<()> {
        stdin.write_all(&self.data)?;
        if !self.data.ends_with(b"\n") {
            stdin.write_all(b"\n")?;
        }
        stdin.write_all(self.delimiter.as_bytes())?;
        stdin.write_all(b"\n")
    }
}

impl SyncResultProgram for WriteFile {
    type Output = ();

    fn parse(&self, _stdout: &str, _stderr: &str) -> Result<(), ShellfsError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn ctx() -> Context {
        Context::new(Config::default(), false).unwrap()
    }

    #[test]
    fn payload_is_terminated_by_delimiter() {
        let program = WriteFile::new(&ctx(), Utf8Path::new("/tmp/out"), "a\nb").unwrap();
        let line = program.executable().command_line();
        assert!(line.starts_with("head -c 3 > \"/tmp/out\" <<'SHELLFS_EOF_"), "{}", line);

        let mut stdin = Vec::new();
        program.write_stdin(&mut stdin).unwrap();
        let expected = format!("a\nb\n{}\n", program.delimiter);
        assert_eq!(String::from_utf8(stdin).unwrap(), expected);
        assert_eq!(
            program.write_targets(),
            Some(WriteTargets::destination("/tmp/out"))
        );
    }

    #[test]
    fn terminated_data_gets_no_extra_newline() {
        let program = WriteFile::new(&ctx(), Utf8Path::new("/tmp/out"), "x\n").unwrap();
        let mut stdin = Vec::new();
        program.write_stdin(&mut stdin).unwrap();
        assert_eq!(String::from_utf8(stdin).unwrap(), format!("x\n{}\n", program.delimiter));
        assert_eq!(program.len(), 2);
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let err = WriteFile::new(&ctx(), Utf8Path::new("/tmp/out"), b"a\0b".to_vec()).unwrap_err();
        assert!(matches!(err, ShellfsError::Validation(_)));
    }
}
