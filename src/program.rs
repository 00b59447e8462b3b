use thiserror::Error;

/// Compile failures for generated workflow source.
///
/// These surface before any `Running` transition: a unit that fails to parse
/// is never created.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("line 1: expected entry point 'async def <name>(MCP):', found '{found}'")]
    MissingEntryPoint { found: String },

    #[error("line {line}: unrecognized statement '{text}'")]
    UnknownStatement { line: u32, text: String },

    #[error("line {line}: {detail}")]
    Malformed { line: u32, detail: String },
}

/// A literal or variable reference in generated source.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Var(String),
}

/// One capability call expression, `MCP.<provider>.<capability>(k=v, ...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub provider: String,
    pub capability: String,
    pub arguments: Vec<(String, Arg)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// A capability invocation. Without `await` it declares a suspended
    /// concurrent call bound to `target`; with `await` it runs inline.
    Invoke {
        target: Option<String>,
        call: CallExpr,
        awaited: bool,
    },
    /// `Wait(a, b, ...)`: structured join over previously declared calls.
    Wait {
        target: Option<String>,
        handles: Vec<String>,
    },
    /// `Sample("question")`: ask the inference provider.
    Sample { target: Option<String>, question: Arg },
    /// `Output(expr)`: emit part of the final answer.
    Output { value: Arg },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub line: u32,
    pub op: Op,
}

/// A parsed generated workflow: one entry-point routine written against the
/// `MCP` dispatch vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowProgram {
    pub name: String,
    pub statements: Vec<Statement>,
    pub source: String,
}

impl WorkflowProgram {
    /// Parse generated source. Line numbers are 1-based over the full text;
    /// the entry-point declaration must be the first line and blank lines are
    /// skipped. Any unrecognized statement is a hard compile failure.
    pub fn parse(source: &str) -> Result<Self, CompileError> {
        let mut lines = source.lines();
        let header = lines.next().unwrap_or_default();
        let name = parse_entry_point(header)?;

        let mut statements = Vec::new();
        for (idx, raw) in source.lines().enumerate().skip(1) {
            let line = (idx + 1) as u32;
            let text = raw.trim();
            if text.is_empty() {
                continue;
            }
            statements.push(Statement {
                line,
                op: parse_statement(line, text)?,
            });
        }

        Ok(WorkflowProgram {
            name,
            statements,
            source: source.to_string(),
        })
    }
}

fn parse_entry_point(header: &str) -> Result<String, CompileError> {
    let fail = || CompileError::MissingEntryPoint {
        found: header.trim().to_string(),
    };

    let rest = header.trim().strip_prefix("async def ").ok_or_else(fail)?;
    let open = rest.find('(').ok_or_else(fail)?;
    let name = rest[..open].trim();
    let tail = rest[open..].trim();
    if !is_identifier(name) || tail != "(MCP):" {
        return Err(fail());
    }
    Ok(name.to_string())
}

fn parse_statement(line: u32, text: &str) -> Result<Op, CompileError> {
    let unknown = || CompileError::UnknownStatement {
        line,
        text: text.to_string(),
    };

    let (target, rest) = split_assignment(text);
    let (awaited, rest) = match rest.strip_prefix("await ") {
        Some(r) => (true, r.trim_start()),
        None => (false, rest),
    };

    let body = rest.strip_prefix("MCP.").ok_or_else(unknown)?;
    let open = body.find('(').ok_or_else(unknown)?;
    if !body.ends_with(')') {
        return Err(CompileError::Malformed {
            line,
            detail: "call is missing its closing parenthesis".to_string(),
        });
    }
    let path = &body[..open];
    let inner = &body[open + 1..body.len() - 1];

    match path {
        "Wait" => {
            require_awaited(line, awaited, "Wait")?;
            let handles = split_arguments(inner)
                .into_iter()
                .map(|a| {
                    let a = a.trim();
                    if is_identifier(a) {
                        Ok(a.to_string())
                    } else {
                        Err(CompileError::Malformed {
                            line,
                            detail: format!("Wait arguments must be variables, found '{a}'"),
                        })
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            if handles.is_empty() {
                return Err(CompileError::Malformed {
                    line,
                    detail: "Wait requires at least one started call".to_string(),
                });
            }
            Ok(Op::Wait { target, handles })
        }
        "Sample" => {
            require_awaited(line, awaited, "Sample")?;
            let question = single_argument(line, inner, "Sample")?;
            Ok(Op::Sample { target, question })
        }
        "Output" => {
            require_awaited(line, awaited, "Output")?;
            if target.is_some() {
                return Err(CompileError::Malformed {
                    line,
                    detail: "Output returns nothing and cannot be assigned".to_string(),
                });
            }
            let value = single_argument(line, inner, "Output")?;
            Ok(Op::Output { value })
        }
        _ => {
            let mut parts = path.splitn(2, '.');
            let provider = parts.next().unwrap_or_default();
            let capability = parts.next().unwrap_or_default();
            if !is_identifier(provider) || !is_identifier(capability) {
                return Err(unknown());
            }

            let mut arguments = Vec::new();
            for piece in split_arguments(inner) {
                let piece = piece.trim();
                let eq = piece.find('=').ok_or_else(|| CompileError::Malformed {
                    line,
                    detail: format!("capability arguments must be keyword=value, found '{piece}'"),
                })?;
                let key = piece[..eq].trim();
                if !is_identifier(key) {
                    return Err(CompileError::Malformed {
                        line,
                        detail: format!("invalid argument name '{key}'"),
                    });
                }
                let value = parse_value(line, piece[eq + 1..].trim())?;
                arguments.push((key.to_string(), value));
            }

            Ok(Op::Invoke {
                target,
                call: CallExpr {
                    provider: provider.to_string(),
                    capability: capability.to_string(),
                    arguments,
                },
                awaited,
            })
        }
    }
}

fn require_awaited(line: u32, awaited: bool, what: &str) -> Result<(), CompileError> {
    if awaited {
        Ok(())
    } else {
        Err(CompileError::Malformed {
            line,
            detail: format!("{what} must be awaited"),
        })
    }
}

fn single_argument(line: u32, inner: &str, what: &str) -> Result<Arg, CompileError> {
    let args = split_arguments(inner);
    if args.len() != 1 {
        return Err(CompileError::Malformed {
            line,
            detail: format!("{what} takes exactly one argument"),
        });
    }
    parse_value(line, args[0].trim())
}

/// Split `target = rest` when the left-hand side is a bare identifier.
fn split_assignment(text: &str) -> (Option<String>, &str) {
    if let Some(eq) = text.find('=') {
        let lhs = text[..eq].trim();
        let rhs = text[eq + 1..].trim_start();
        // Reject `==` and anything that is not a plain variable binding.
        if is_identifier(lhs) && !rhs.starts_with('=') {
            return (Some(lhs.to_string()), rhs);
        }
    }
    (None, text)
}

/// Split a call's argument text on top-level commas, respecting quotes.
fn split_arguments(inner: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    for ch in inner.chars() {
        match ch {
            '"' => {
                in_string = !in_string;
                current.push(ch);
            }
            ',' if !in_string => {
                if !current.trim().is_empty() {
                    args.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        args.push(current.trim().to_string());
    }
    args
}

fn parse_value(line: u32, text: &str) -> Result<Arg, CompileError> {
    if let Some(stripped) = text.strip_prefix('"') {
        let Some(body) = stripped.strip_suffix('"') else {
            return Err(CompileError::Malformed {
                line,
                detail: format!("unterminated string literal '{text}'"),
            });
        };
        return Ok(Arg::Str(body.to_string()));
    }
    if text == "true" {
        return Ok(Arg::Bool(true));
    }
    if text == "false" {
        return Ok(Arg::Bool(false));
    }
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Arg::Int(n));
    }
    if let Ok(f) = text.parse::<f64>() {
        return Ok(Arg::Float(f));
    }
    if is_identifier(text) {
        return Ok(Arg::Var(text.to_string()));
    }
    Err(CompileError::Malformed {
        line,
        detail: format!("invalid value '{text}'"),
    })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
