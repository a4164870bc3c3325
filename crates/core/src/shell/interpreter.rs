use super::parse::{self, AndOrList, Command, Connector, Segment, Word};
use super::{ExecHandler, ScriptInterpreter, CANCELLED_STATUS};
use crate::context::ExecContext;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// POSIX-flavoured interpreter for job scripts.
///
/// Supports simple commands joined by `;`, newlines, `&&` and `||`,
/// quoting, parameter expansion and variable assignments. Scripts run
/// with errexit semantics: a failing command that is not guarded by
/// `&&` or `||` ends the script with its status.
#[derive(Debug, Default, Clone)]
pub struct ShellInterpreter;

impl ShellInterpreter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ScriptInterpreter for ShellInterpreter {
    async fn run(
        &self,
        script: &str,
        args: &[String],
        ctx: &ExecContext,
        handler: &dyn ExecHandler,
    ) -> Result<i32> {
        let parsed = parse::parse(script).context("parse script")?;
        let mut shell = Shell {
            vars: ctx.env.clone(),
            positional: args.to_vec(),
            status: 0,
            cwd: ctx.working_dir.clone(),
        };

        for list in &parsed.lists {
            match shell.run_list(list, ctx, handler).await? {
                Flow::Continue => {}
                Flow::Exit(status) => return Ok(status),
            }
        }

        Ok(shell.status)
    }
}

enum Flow {
    Continue,
    Exit(i32),
}

enum Outcome {
    Status(i32),
    Exit(i32),
}

struct Shell {
    vars: BTreeMap<String, String>,
    positional: Vec<String>,
    status: i32,
    cwd: PathBuf,
}

impl Shell {
    async fn run_list(
        &mut self,
        list: &AndOrList,
        ctx: &ExecContext,
        handler: &dyn ExecHandler,
    ) -> Result<Flow> {
        let mut status = match self.run_command(&list.first, ctx, handler).await? {
            Outcome::Status(status) => status,
            Outcome::Exit(status) => return Ok(Flow::Exit(status)),
        };
        self.status = status;
        let mut last_ran = 0;

        for (position, (connector, command)) in list.rest.iter().enumerate() {
            let run = match connector {
                Connector::And => status == 0,
                Connector::Or => status != 0,
            };
            if !run {
                continue;
            }

            status = match self.run_command(command, ctx, handler).await? {
                Outcome::Status(status) => status,
                Outcome::Exit(status) => return Ok(Flow::Exit(status)),
            };
            self.status = status;
            last_ran = position + 1;
        }

        // Only the final command of a list trips errexit
        if status != 0 && last_ran == list.rest.len() {
            return Ok(Flow::Exit(status));
        }

        Ok(Flow::Continue)
    }

    async fn run_command(
        &mut self,
        command: &Command,
        ctx: &ExecContext,
        handler: &dyn ExecHandler,
    ) -> Result<Outcome> {
        if ctx.is_cancelled() {
            return Ok(Outcome::Exit(CANCELLED_STATUS));
        }

        let mut argv = Vec::new();
        for word in &command.words {
            argv.extend(self.expand(word));
        }

        let mut assigned = BTreeMap::new();
        for assignment in &command.assignments {
            assigned.insert(assignment.name.clone(), self.expand_joined(&assignment.value));
        }

        if argv.is_empty() {
            self.vars.extend(assigned);
            return Ok(Outcome::Status(0));
        }

        let args = &argv[1..];
        let status = match argv[0].as_str() {
            "true" | ":" => 0,
            "false" => 1,
            "exit" => {
                let status = match args.first() {
                    Some(code) => code.parse().unwrap_or(2),
                    None => self.status,
                };
                return Ok(Outcome::Exit(status));
            }
            "echo" => {
                ctx.stdout.write_line(args.join(" "));
                0
            }
            "export" => {
                for arg in args {
                    match arg.split_once('=') {
                        Some((name, value)) if parse::is_name(name) => {
                            self.vars.insert(name.to_string(), value.to_string());
                        }
                        Some(_) => {
                            ctx.stderr
                                .write_line(format!("export: '{}': not a valid identifier", arg));
                            return Ok(Outcome::Status(1));
                        }
                        None => {
                            self.vars.entry(arg.clone()).or_default();
                        }
                    }
                }
                0
            }
            "cd" => self.change_dir(args, ctx),
            _ => {
                let mut command_ctx = ctx.clone();
                command_ctx.env = self.vars.clone();
                command_ctx.env.extend(assigned);
                command_ctx.working_dir = self.cwd.clone();
                handler.exec(&command_ctx, &argv).await?
            }
        };

        Ok(Outcome::Status(status))
    }

    fn change_dir(&mut self, args: &[String], ctx: &ExecContext) -> i32 {
        let target = match args.first() {
            Some(dir) => self.cwd.join(dir),
            None => match self.vars.get("HOME") {
                Some(home) => PathBuf::from(home),
                None => return 0,
            },
        };

        if !target.is_dir() {
            ctx.stderr.write_line(format!(
                "cd: {}: No such file or directory",
                target.display()
            ));
            return 1;
        }

        self.vars
            .insert("PWD".to_string(), target.display().to_string());
        self.cwd = target;
        0
    }

    fn param(&self, name: &str) -> Vec<String> {
        match name {
            "@" | "*" => self.positional.clone(),
            "#" => vec![self.positional.len().to_string()],
            "?" => vec![self.status.to_string()],
            "0" => vec!["devflow".to_string()],
            digits if digits.chars().all(|c| c.is_ascii_digit()) => {
                let value = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| index.checked_sub(1))
                    .and_then(|index| self.positional.get(index))
                    .cloned()
                    .unwrap_or_default();
                vec![value]
            }
            name => vec![self.vars.get(name).cloned().unwrap_or_default()],
        }
    }

    /// Expand a word into fields, splitting unquoted expansions on whitespace
    fn expand(&self, word: &Word) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut has_field = false;
        let mut only_empty_at = false;

        for segment in &word.segments {
            match segment {
                Segment::Literal { text, quoted } => {
                    current.push_str(text);
                    has_field |= *quoted || !text.is_empty();
                }
                Segment::Param { name, quoted: true } if name == "@" => {
                    // "$@" keeps every positional parameter as its own field
                    let mut values = self.positional.iter();
                    only_empty_at = self.positional.is_empty();
                    if let Some(first) = values.next() {
                        current.push_str(first);
                        has_field = true;
                        for value in values {
                            fields.push(std::mem::take(&mut current));
                            current.push_str(value);
                        }
                    }
                }
                Segment::Param { name, quoted: true } => {
                    current.push_str(&self.param(name).join(" "));
                    has_field = true;
                }
                Segment::Param {
                    name,
                    quoted: false,
                } => {
                    let joined = self.param(name).join(" ");
                    let mut pieces = joined.split_whitespace();
                    if let Some(first) = pieces.next() {
                        if joined.starts_with(char::is_whitespace) && has_field {
                            fields.push(std::mem::take(&mut current));
                        }
                        current.push_str(first);
                        has_field = true;
                        for piece in pieces {
                            fields.push(std::mem::take(&mut current));
                            current.push_str(piece);
                        }
                        if joined.ends_with(char::is_whitespace) {
                            fields.push(std::mem::take(&mut current));
                            has_field = false;
                        }
                    }
                }
            }
        }

        // "$@" with no positional parameters expands to nothing
        if only_empty_at && fields.is_empty() && current.is_empty() {
            return fields;
        }
        if has_field {
            fields.push(current);
        }
        fields
    }

    /// Expand a word without field splitting (assignment values)
    fn expand_joined(&self, word: &Word) -> String {
        word.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal { text, .. } => text.clone(),
                Segment::Param { name, .. } => self.param(name).join(" "),
            })
            .collect()
    }
}
