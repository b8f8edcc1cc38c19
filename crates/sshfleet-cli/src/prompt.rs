//! Interactive credential prompts.

use std::collections::HashMap;

use anyhow::Result;
use dialoguer::Password;

use sshfleet_core::config::HostEntry;
use sshfleet_core::model::HostDescriptor;

/// Ask for the password of `host` without echoing it.
pub fn prompt_password(host: &HostDescriptor) -> Result<String> {
    let password: String = Password::new()
        .with_prompt(format!("Password for {}", host.label()))
        .allow_empty_password(true)
        .interact()?;
    Ok(password)
}

/// Fill in passwords for hosts that want one and do not have one yet.
///
/// A host wants a password when `ask_all` is set or its entry says
/// `ask_password = true`. Each `user@host:port` is asked once, even if it
/// appears several times. Returns the number of prompts shown.
pub fn fill_passwords<F>(hosts: &mut [HostEntry], ask_all: bool, mut ask: F) -> Result<usize>
where
    F: FnMut(&HostDescriptor) -> Result<String>,
{
    let mut answers: HashMap<String, String> = HashMap::new();
    for entry in hosts {
        if entry.host.password.is_some() || !(ask_all || entry.ask_password) {
            continue;
        }
        let label = entry.host.label();
        let password = match answers.get(&label) {
            Some(known) => known.clone(),
            None => {
                let answer = ask(&entry.host)?;
                answers.insert(label, answer.clone());
                answer
            }
        };
        entry.host.password = Some(password);
    }
    Ok(answers.len())
}
