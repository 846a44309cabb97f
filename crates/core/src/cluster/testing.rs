use super::remote::{CommandOutput, CommandRunner};
use crate::error::Result;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

type Responder = Box<dyn Fn(&str, &str, usize) -> Result<CommandOutput> + Send + Sync>;

/// Records every command and answers through a responder closure. The third
/// responder argument counts earlier calls with the same address and command.
pub(crate) struct FakeRunner {
    responder: Responder,
    pub commands: Mutex<Vec<(String, String)>>,
    pub copies: Mutex<Vec<(String, String, String)>>,
}

impl FakeRunner {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &str, usize) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            commands: Mutex::new(Vec::new()),
            copies: Mutex::new(Vec::new()),
        }
    }

    /// Every command succeeds and prints a pid
    pub fn ok() -> Self {
        Self::new(|_, _, _| Ok(output(0, "4242\n")))
    }

    pub fn commands_for(&self, address: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

pub(crate) fn output(exit_code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_string(),
        stderr: if exit_code == 0 { String::new() } else { "boom".to_string() },
    }
}

#[async_trait::async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, address: &str, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        let attempt = {
            let mut commands = self.commands.lock().unwrap();
            let attempt = commands
                .iter()
                .filter(|(a, c)| a == address && c == command)
                .count();
            commands.push((address.to_string(), command.to_string()));
            attempt
        };
        (self.responder)(address, command, attempt)
    }

    async fn copy_to(
        &self,
        address: &str,
        local_path: &Path,
        remote_path: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        self.copies.lock().unwrap().push((
            address.to_string(),
            local_path.display().to_string(),
            remote_path.to_string(),
        ));
        Ok(output(0, ""))
    }
}
