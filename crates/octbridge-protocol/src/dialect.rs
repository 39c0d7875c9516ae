//! Engine dialects: the engine source the driver sends.
//!
//! Every call script is a single line. It loads the request envelope,
//! invokes the target with the requested output count, saves the outputs
//! (or the error details) to the response envelope and prints a sentinel.

use std::{fmt, fmt::Write as _, path::Path};

use octbridge_core::Nout;
use octbridge_process::EngineDefaults;

/// Request envelope variable: a 1xN cell of arguments.
pub const ARGS_VAR: &str = "ob_args";
/// Response envelope variable on success: a 1xN cell of outputs.
pub const OUT_VAR: &str = "ob_out";
/// Response envelope variable on failure: a struct with message, identifier and stack.
pub const ERR_VAR: &str = "ob_err";

/// What a call script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget<'a> {
    /// A named function, optionally run from a directory (m-file paths).
    Function { name: &'a str, dir: Option<&'a Path> },
    /// The first argument is engine source to evaluate.
    Eval,
}

/// Everything a dialect needs to write one call script.
#[derive(Debug, Clone, Copy)]
pub struct CallSpec<'a> {
    pub target: CallTarget<'a>,
    pub nout: Nout,
    pub store_as: Option<&'a str>,
    /// 1-based argument positions holding engine addresses to resolve.
    pub replacements: &'a [usize],
    pub request: &'a Path,
    pub response: &'a Path,
    pub ok_line: &'a str,
    pub err_line: &'a str,
}

/// Engine-specific script generation and discovery defaults.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// How to find and launch the engine.
    fn defaults(&self) -> EngineDefaults;

    /// Commands run once after launch to make the prompt scriptable.
    fn setup_script(&self) -> String;

    /// A command that prints `sentinel_line` on its own line.
    fn sync_script(&self, sentinel_line: &str) -> String;

    /// The single-line script for one call.
    fn call_script(&self, call: &CallSpec<'_>) -> String;

    /// The command asking the engine to exit.
    fn exit_command(&self) -> &str;
}

/// GNU Octave.
#[derive(Debug, Default, Clone, Copy)]
pub struct OctaveDialect;

const OCTAVE_DEFAULTS: EngineDefaults = EngineDefaults {
    executable_vars: &["OCTAVE_EXECUTABLE", "OCTAVE"],
    flags_var: Some("OCTAVE_CLI_OPTIONS"),
    candidates: &["octave-cli", "octave"],
    flags: &[
        "--no-gui",
        "--quiet",
        "--no-init-file",
        "--no-line-editing",
        "--interactive",
    ],
};

/// Octave's message when a call asks for more outputs than the function has.
const TOO_MANY_OUTPUTS: &str = "called with too many outputs";

/// Quote `s` as an Octave single-quoted string literal.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

impl OctaveDialect {
    /// Capture `ans` after running `statement` with no output assignment.
    fn ans_capture(statement: &str) -> String {
        format!(
            "clear('ans'); {statement}; \
             if exist('ans', 'var') == 1, {OUT_VAR} = {{ans}}; else, {OUT_VAR} = {{}}; end; "
        )
    }

    /// Call `name` keeping `nout` outputs.
    ///
    /// `nargout` gives the declared count for functions with a fixed output
    /// list. Builtins and `varargout` functions report a negative count or
    /// none at all; for those the call is retried with one output fewer
    /// while the engine rejects the count, down to capturing `ans`. The
    /// engine checks the count before the function body runs.
    fn function_call(name: &str, nout: Nout) -> String {
        let call = format!("feval({name}, {ARGS_VAR}{{:}})");
        let mut s = String::new();
        match nout {
            Nout::Count(0) => {
                let _ = write!(s, "{call}; {OUT_VAR} = {{}}; ");
                return s;
            }
            Nout::Count(k) => {
                let _ = write!(
                    s,
                    "ob_m = -1; try, ob_m = nargout({name}); catch, end; \
                     ob_n = {k}; if ob_m >= 0, ob_n = min(ob_n, ob_m); end; "
                );
            }
            Nout::Max => {
                let _ = write!(
                    s,
                    "ob_m = -1; try, ob_m = nargout({name}); catch, end; \
                     if ob_m >= 0, ob_n = ob_m; else, ob_n = max(abs(ob_m) - 1, 1); end; "
                );
            }
        }
        let _ = write!(
            s,
            "ob_done = false; while ~ob_done, \
             if ob_n == 0, {ans}ob_done = true; \
             else, try, {OUT_VAR} = cell(1, ob_n); [{OUT_VAR}{{1:ob_n}}] = {call}; \
             ob_done = true; \
             catch ob_x, \
             if ob_m < 0 && ~isempty(strfind(ob_x.message, '{TOO_MANY_OUTPUTS}')), \
             ob_n = ob_n - 1; else, rethrow(ob_x); end; \
             end; end; end; ",
            ans = Self::ans_capture(&call),
        );
        s
    }
}

impl Dialect for OctaveDialect {
    fn defaults(&self) -> EngineDefaults {
        OCTAVE_DEFAULTS
    }

    fn setup_script(&self) -> String {
        "PS1(''); PS2(''); more off; page_screen_output(false); crash_dumps_octave_core(false);"
            .to_string()
    }

    fn sync_script(&self, sentinel_line: &str) -> String {
        format!("printf('%s\\n', {}); fflush(stdout);", quote(sentinel_line))
    }

    fn call_script(&self, call: &CallSpec<'_>) -> String {
        let mut s = String::with_capacity(1024);
        let _ = write!(
            s,
            "clear('ob_cwd'); try, ob_req = load('-mat', {}); {ARGS_VAR} = ob_req.{ARGS_VAR}; ",
            quote_path(call.request)
        );
        if !call.replacements.is_empty() {
            let positions: Vec<String> =
                call.replacements.iter().map(ToString::to_string).collect();
            let _ = write!(
                s,
                "for ob_i = [{}], {ARGS_VAR}{{ob_i}} = evalin('base', {ARGS_VAR}{{ob_i}}); end; ",
                positions.join(" ")
            );
        }

        match call.target {
            CallTarget::Eval => {
                let _ = write!(s, "ob_code = {ARGS_VAR}{{1}}; ");
                if call.nout == Nout::Count(0) {
                    let _ = write!(s, "eval(ob_code); {OUT_VAR} = {{}}; ");
                } else {
                    let _ = write!(s, "{}", Self::ans_capture("eval(ob_code)"));
                }
            }
            CallTarget::Function { name, dir } => {
                let name_lit = quote(name);
                if let Some(dir) = dir {
                    let _ = write!(s, "ob_cwd = pwd(); cd({}); ", quote_path(dir));
                }
                if !name.contains('.') {
                    let _ = write!(
                        s,
                        "if exist({name_lit}) == 0, \
                         error('octbridge:undefined', '''%s'' undefined', {name_lit}); end; "
                    );
                }
                let _ = write!(s, "{}", Self::function_call(&name_lit, call.nout));
            }
        }

        if let Some(var) = call.store_as {
            let _ = write!(
                s,
                "if numel({OUT_VAR}) > 0, assignin('base', {}, {OUT_VAR}{{1}}); end; \
                 {OUT_VAR} = {{}}; ",
                quote(var)
            );
        }

        let restore_cwd = "if exist('ob_cwd', 'var') == 1, cd(ob_cwd); end; ";
        let _ = write!(
            s,
            "save('-v6', {resp}, '{OUT_VAR}'); {restore_cwd}printf('%s\\n', {ok}); \
             catch ob_e, {restore_cwd}\
             {ERR_VAR} = struct('message', ob_e.message, 'identifier', ob_e.identifier); \
             {ERR_VAR}.stack = ob_e.stack; try, save('-v6', {resp}, '{ERR_VAR}'); catch, end; \
             printf('%s\\n', {err}); end; fflush(stdout); \
             clear('ob_req', '{ARGS_VAR}', '{OUT_VAR}', '{ERR_VAR}', 'ob_e', 'ob_x', 'ob_m', \
             'ob_n', 'ob_i', 'ob_done', 'ob_code', 'ob_cwd');",
            resp = quote_path(call.response),
            ok = quote(call.ok_line),
            err = quote(call.err_line),
        );
        s
    }

    fn exit_command(&self) -> &str {
        "exit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec<'a>(target: CallTarget<'a>, nout: Nout) -> CallSpec<'a> {
        CallSpec {
            target,
            nout,
            store_as: None,
            replacements: &[],
            request: Path::new("/tmp/req.mat"),
            response: Path::new("/tmp/it's/resp.mat"),
            ok_line: "<<OK>>",
            err_line: "<<ERR>>",
        }
    }

    fn function(name: &str) -> CallTarget<'_> {
        CallTarget::Function { name, dir: None }
    }

    #[test]
    fn test_call_script_is_one_line() {
        let script = OctaveDialect.call_script(&spec(function("zeros"), Nout::Count(1)));
        assert!(!script.contains('\n'));
        assert!(script.contains("load('-mat', '/tmp/req.mat')"));
        assert!(script.contains("save('-v6', '/tmp/it''s/resp.mat', 'ob_out')"));
        assert!(script.contains("if exist('zeros') == 0, error('octbridge:undefined'"));
        assert!(script.contains("ob_n = 1;"));
        assert!(script.contains("printf('%s\\n', '<<OK>>')"));
        assert!(script.contains("printf('%s\\n', '<<ERR>>')"));
    }

    #[test]
    fn test_zero_outputs_skip_capture() {
        let script = OctaveDialect.call_script(&spec(function("disp"), Nout::Count(0)));
        assert!(script.contains("feval('disp', ob_args{:}); ob_out = {};"));
        assert!(!script.contains("nargout("));
    }

    #[test]
    fn test_dotted_names_skip_existence_check() {
        let script = OctaveDialect.call_script(&spec(function("pkg.sub.fn"), Nout::Max));
        assert!(!script.contains("exist('pkg.sub.fn')"));
        assert!(script.contains("ob_n = max(abs(ob_m) - 1, 1)"));
    }

    #[test]
    fn test_unknown_output_counts_step_down() {
        let script = OctaveDialect.call_script(&spec(function("zeros"), Nout::Count(2)));
        assert!(script.contains("ob_n = 2; if ob_m >= 0, ob_n = min(ob_n, ob_m); end;"));
        assert!(script.contains(
            "if ob_m < 0 && ~isempty(strfind(ob_x.message, 'called with too many outputs'))"
        ));
        assert!(script.contains("ob_n = ob_n - 1; else, rethrow(ob_x); end;"));
        assert!(script.contains("if ob_n == 0, clear('ans'); feval('zeros', ob_args{:});"));
    }

    #[test]
    fn test_script_dir_and_store_as() {
        let mut call = spec(
            CallTarget::Function {
                name: "model",
                dir: Some(Path::new("/work/models")),
            },
            Nout::Count(1),
        );
        call.store_as = Some("result");
        let script = OctaveDialect.call_script(&call);
        assert!(script.contains("ob_cwd = pwd(); cd('/work/models');"));
        assert!(script.contains("assignin('base', 'result', ob_out{1})"));
        assert_eq!(script.matches("cd(ob_cwd)").count(), 2);
    }

    #[test]
    fn test_references_resolved_in_base_workspace() {
        let mut call = spec(function("feval"), Nout::Count(1));
        call.replacements = &[1, 3];
        let script = OctaveDialect.call_script(&call);
        let resolve = "for ob_i = [1 3], ob_args{ob_i} = evalin('base', ob_args{ob_i}); end;";
        let load = script.find("ob_args = ob_req.ob_args;").unwrap();
        let at = script.find(resolve).unwrap();
        assert!(load < at && at < script.find("feval('feval'").unwrap());

        let plain = OctaveDialect.call_script(&spec(CallTarget::Eval, Nout::Count(1)));
        assert!(!plain.contains("evalin('base'"));
    }

    #[test]
    fn test_eval_captures_ans() {
        let script = OctaveDialect.call_script(&spec(CallTarget::Eval, Nout::Count(1)));
        assert!(script.contains("ob_code = ob_args{1};"));
        assert!(script.contains("clear('ans'); eval(ob_code);"));
    }

    #[test]
    fn test_sync_script() {
        assert_eq!(
            OctaveDialect.sync_script("<<S>>"),
            "printf('%s\\n', '<<S>>'); fflush(stdout);"
        );
    }
}
