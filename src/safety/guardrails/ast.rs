use brush_parser::ast;

/// Structural violations the parser-backed pass can prove, as opposed to
/// the pattern guesses the regex layer makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// `sudo`, `su`, `doas` as the program
    PrivilegeEscalation,
    /// `eval`, `source`, or `.` as the program
    EvalLike,
    /// a shell or interpreter on the right side of a `|`
    DangerousPipeTarget,
    /// write-redirection onto a raw block device
    DangerousRedirection,
}

#[derive(Debug, Clone)]
pub struct AstViolation {
    pub kind: ViolationKind,
    pub description: String,
}

const SHELL_PIPE_TARGETS: &[&str] = &[
    "sh", "bash", "zsh", "dash", "ksh", "csh", "tcsh", "fish", "python", "python2", "python3",
    "perl", "ruby", "node", "php",
];

const RAW_DEVICE_PREFIXES: &[&str] = &["/dev/sd", "/dev/nv", "/dev/hd", "/dev/vd", "/dev/disk"];

/// Parse a shell command and report structural violations.
///
/// An unparseable command reports nothing; the regex layer still gets its
/// turn at it.
pub fn scan_command(command: &str) -> Vec<AstViolation> {
    let mut scan = Scan::default();
    if let Some(program) = parse(command) {
        for list in &program.complete_commands {
            scan.compound_list(list);
        }
    }
    scan.violations
}

fn parse(command: &str) -> Option<ast::Program> {
    let options = brush_parser::ParserOptions::default();
    let source = brush_parser::SourceInfo::default();
    let reader = std::io::BufReader::new(std::io::Cursor::new(command));
    brush_parser::Parser::new(reader, &options, &source)
        .parse_program()
        .ok()
}

/// Accumulates violations while descending through the parsed program.
#[derive(Default)]
struct Scan {
    violations: Vec<AstViolation>,
}

impl Scan {
    fn flag(&mut self, kind: ViolationKind, description: String) {
        self.violations.push(AstViolation { kind, description });
    }

    fn compound_list(&mut self, list: &ast::CompoundList) {
        for item in &list.0 {
            let and_or = &item.0;
            self.pipeline(&and_or.first);
            for follow in &and_or.additional {
                let (ast::AndOr::And(pipeline) | ast::AndOr::Or(pipeline)) = follow;
                self.pipeline(pipeline);
            }
        }
    }

    fn pipeline(&mut self, pipeline: &ast::Pipeline) {
        for (position, command) in pipeline.seq.iter().enumerate() {
            // Everything after the first `|` receives piped input
            self.command(command, position > 0);
        }
    }

    fn command(&mut self, command: &ast::Command, piped_into: bool) {
        match command {
            ast::Command::Simple(simple) => self.simple(simple, piped_into),
            ast::Command::Compound(inner, redirects) => {
                for list in nested_lists(inner) {
                    self.compound_list(list);
                }
                if let Some(redirects) = redirects {
                    for redirect in &redirects.0 {
                        self.redirect(redirect);
                    }
                }
            }
            ast::Command::Function(_) | ast::Command::ExtendedTest(_) => {}
        }
    }

    fn simple(&mut self, command: &ast::SimpleCommand, piped_into: bool) {
        let word = command
            .word_or_name
            .as_ref()
            .map_or("", |w| w.value.as_str());
        // `/usr/bin/sudo` counts the same as `sudo`
        let program = word.rsplit('/').next().unwrap_or(word);

        match program {
            "sudo" | "su" | "doas" => self.flag(
                ViolationKind::PrivilegeEscalation,
                format!("'{program}' escalates privileges"),
            ),
            "eval" | "source" | "." => self.flag(
                ViolationKind::EvalLike,
                format!("'{program}' executes arbitrary code"),
            ),
            _ => {}
        }

        if piped_into && SHELL_PIPE_TARGETS.contains(&program) {
            self.flag(
                ViolationKind::DangerousPipeTarget,
                format!("piping into '{program}' allows arbitrary code execution"),
            );
        }

        let prefix_items = command.prefix.iter().flat_map(|p| p.0.iter());
        let suffix_items = command.suffix.iter().flat_map(|s| s.0.iter());
        for item in prefix_items.chain(suffix_items) {
            if let ast::CommandPrefixOrSuffixItem::IoRedirect(redirect) = item {
                self.redirect(redirect);
            }
        }
    }

    fn redirect(&mut self, redirect: &ast::IoRedirect) {
        let ast::IoRedirect::File(_, kind, ast::IoFileRedirectTarget::Filename(target)) = redirect
        else {
            return;
        };
        let writes = matches!(
            kind,
            ast::IoFileRedirectKind::Write
                | ast::IoFileRedirectKind::Append
                | ast::IoFileRedirectKind::Clobber
        );
        if writes
            && RAW_DEVICE_PREFIXES
                .iter()
                .any(|prefix| target.value.starts_with(prefix))
        {
            self.flag(
                ViolationKind::DangerousRedirection,
                format!("writing to device '{}' can destroy data", target.value),
            );
        }
    }
}

/// The compound lists a compound command can hide commands in.
fn nested_lists(compound: &ast::CompoundCommand) -> Vec<&ast::CompoundList> {
    use ast::CompoundCommand as C;
    let mut lists = Vec::new();
    match compound {
        C::Subshell(inner) => lists.push(&inner.0),
        C::BraceGroup(inner) => lists.push(&inner.0),
        C::ForClause(inner) => lists.push(&inner.body.0),
        C::ArithmeticForClause(inner) => lists.push(&inner.body.0),
        C::WhileClause(inner) | C::UntilClause(inner) => {
            lists.push(&inner.0);
            lists.push(&inner.1.0);
        }
        C::IfClause(inner) => {
            lists.push(&inner.condition);
            lists.push(&inner.then);
            for else_clause in inner.elses.iter().flatten() {
                if let Some(condition) = &else_clause.condition {
                    lists.push(condition);
                }
                lists.push(&else_clause.body);
            }
        }
        C::CaseClause(inner) => {
            lists.extend(inner.cases.iter().filter_map(|case| case.cmd.as_ref()));
        }
        C::Arithmetic(_) => {}
    }
    lists
}
