//! The Poke compiler
//!
//! An incremental compiler from Poke source to PVM programs. A
//! [`Compiler`] owns the virtual machine it generates code for and
//! the top-level compile-time environment that survives between
//! compilations.
//!
//! Every entry point follows the same discipline: duplicate the
//! top-level environment, parse and run the phase pipeline against
//! the duplicate, and only when everything succeeded swap the
//! duplicate in. A failed compilation therefore never perturbs the
//! live environment.
//!
//! The pipeline runs in two phase groups plus the back end:
//!
//! ```text
//! front:  trans1 anal1 typify1 promo trans2 fold trans3 typify2 anal2
//! middle: fold trans4 analf
//! back:   codegen
//! ```
//!
//! The compiler bootstraps itself by compiling `pkl-rt.pk` and then
//! `std.pk`, taken from the `rt_path` directory when one is given
//! and from the embedded copies otherwise.

pub mod anal;
pub mod ast;
pub mod env;
pub mod fold;
pub mod gen;
pub mod lexer;
pub mod parser;
pub mod pass;
pub mod promo;
pub mod trans;
pub mod typify;

use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use poke_core::program::Program;
use poke_core::value::Value;
use poke_runtime::Vm;

pub use ast::Ast;
pub use env::{CtEnv, Namespace};
pub use parser::{ParseMode, Parser};
pub use pass::{do_pass, Phase};

use anal::{Anal1, Anal2, AnalF};
use fold::Fold;
use gen::GenMode;
use promo::Promo;
use trans::{Trans1, Trans2, Trans3, Trans4};
use typify::{Typify1, Typify2};

/// Embedded bootstrap sources; a file of the same name under the
/// compiler's `rt_path` overrides its embedded copy.
static PKL_RT_PK: &str = include_str!("../rt/pkl-rt.pk");
static STD_PK: &str = include_str!("../rt/std.pk");

pub struct Compiler {
    /// The arena every compilation parses into. Declarations that
    /// survive in the environment keep referring into it, so it
    /// lives as long as the compiler; nodes from failed attempts
    /// are simply never reached again.
    ast: Ast,
    env: CtEnv,
    vm: Vm,
    rt_path: Option<PathBuf>,
    bootstrapped: bool,
    error_on_warning: bool,
    quiet: bool,
}

impl Compiler {
    /// Construct a compiler for the given VM and bootstrap it. An
    /// error bootstrapping is an internal error.
    pub fn new(vm: Vm, rt_path: Option<&Path>) -> Result<Compiler, String> {
        let mut compiler = Compiler {
            ast: Ast::new(),
            env: CtEnv::new(),
            vm,
            rt_path: rt_path.map(Path::to_path_buf),
            bootstrapped: false,
            error_on_warning: false,
            quiet: false,
        };

        let rt = compiler
            .rt_source("pkl-rt.pk")
            .unwrap_or_else(|| PKL_RT_PK.to_string());
        compiler
            .compile_buffer(&rt)
            .map_err(|e| format!("internal error: compiler failed to bootstrap itself: {}", e))?;
        compiler.bootstrapped = true;

        let std = compiler
            .rt_source("std.pk")
            .unwrap_or_else(|| STD_PK.to_string());
        compiler.compile_buffer(&std)?;

        Ok(compiler)
    }

    fn rt_source(&self, name: &str) -> Option<String> {
        let dir = self.rt_path.as_ref()?;
        std::fs::read_to_string(dir.join(name)).ok()
    }

    /* Accessors.  */

    pub fn env(&self) -> &CtEnv {
        &self.env
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    pub fn bootstrapped_p(&self) -> bool {
        self.bootstrapped
    }

    pub fn set_error_on_warning(&mut self, on: bool) {
        self.error_on_warning = on;
    }

    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    /* Compilation entry points.  */

    /// Compile and execute a buffer of declarations and statements.
    pub fn compile_buffer(&mut self, src: &str) -> Result<(), String> {
        let mut env = self.env.dup_toplevel();
        let program = self.compile_with(&mut env, src, ParseMode::Program, GenMode::Program)?;
        self.run_program(&program)?;
        self.env = env;
        Ok(())
    }

    /// Compile and execute a buffer, returning the value of its
    /// last expression statement, if any.
    pub fn compile_statement(&mut self, src: &str) -> Result<Option<Value>, String> {
        let mut env = self.env.dup_toplevel();
        let program = self.compile_with(&mut env, src, ParseMode::Program, GenMode::Statement)?;
        let val = self.run_program(&program)?;
        self.env = env;
        Ok(if val.is_null() { None } else { Some(val) })
    }

    /// Compile a single expression to an executable program without
    /// running it.
    pub fn compile_expression(&mut self, src: &str) -> Result<Rc<Program>, String> {
        let mut env = self.env.dup_toplevel();
        let program =
            self.compile_with(&mut env, src, ParseMode::Expression, GenMode::Expression)?;
        self.env = env;
        Ok(program)
    }

    /// Compile and execute a file.
    pub fn compile_file(&mut self, path: &Path) -> Result<(), String> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        self.compile_buffer(&src)
            .map_err(|e| format!("{}: {}", path.display(), e))
    }

    fn compile_with(
        &mut self,
        env: &mut CtEnv,
        src: &str,
        parse_mode: ParseMode,
        gen_mode: GenMode,
    ) -> Result<Rc<Program>, String> {
        let root = Parser::new(&mut self.ast, env, src)?.parse(parse_mode)?;
        let program = self.rest_of_compilation(root, gen_mode)?;
        Ok(Rc::new(program))
    }

    /// Run the phase pipeline over a parsed tree and generate code.
    fn rest_of_compilation(
        &mut self,
        root: ast::NodeId,
        gen_mode: GenMode,
    ) -> Result<Program, String> {
        let mut trans1 = Trans1::default();
        let mut anal1 = Anal1::default();
        let mut typify1 = Typify1::default();
        let mut promo = Promo::default();
        let mut trans2 = Trans2::default();
        let mut fold = Fold::default();
        let mut trans3 = Trans3::default();
        let mut typify2 = Typify2::default();
        let mut anal2 = Anal2::default();

        do_pass(
            &mut self.ast,
            root,
            &mut [
                &mut trans1,
                &mut anal1,
                &mut typify1,
                &mut promo,
                &mut trans2,
                &mut fold,
                &mut trans3,
                &mut typify2,
                &mut anal2,
            ],
            true,
        )?;
        self.check_diags(&mut [
            &mut trans1,
            &mut anal1,
            &mut typify1,
            &mut promo,
            &mut trans2,
            &mut fold,
            &mut trans3,
            &mut typify2,
            &mut anal2,
        ])?;

        let mut fold2 = Fold::default();
        let mut trans4 = Trans4::default();
        let mut analf = AnalF::default();
        do_pass(
            &mut self.ast,
            root,
            &mut [&mut fold2, &mut trans4, &mut analf],
            true,
        )?;
        self.check_diags(&mut [&mut fold2, &mut trans4, &mut analf])?;

        debug!("generating code");
        let mut program = gen::generate(&self.ast, root, &mut self.vm, gen_mode)?;
        program.make_executable()?;
        Ok(program)
    }

    /// Collect phase diagnostics; abort between phase groups when
    /// any error was reported. Warnings are promoted to errors when
    /// so configured.
    fn check_diags(&self, phases: &mut [&mut dyn Phase]) -> Result<(), String> {
        let mut errors = 0usize;
        let mut messages: Vec<String> = Vec::new();
        for phase in phases {
            let diag = phase.diag();
            errors += diag.errors;
            if self.error_on_warning {
                errors += diag.warnings;
            }
            messages.append(&mut diag.messages);
        }
        if !self.quiet {
            for m in &messages {
                eprintln!("{}", m);
            }
        }
        if errors > 0 {
            Err(messages.join("\n"))
        } else {
            Ok(())
        }
    }

    fn run_program(&mut self, program: &Rc<Program>) -> Result<Value, String> {
        match self.vm.run(program) {
            Ok(val) => Ok(val),
            Err(exc) => {
                let code = self.vm.exception_code(exc).unwrap_or(-1);
                let msg = self.vm.exception_message(exc);
                Err(format!("unhandled exception: {} ({})", msg, code))
            }
        }
    }

    /* Module loading.  */

    /// Find a module in the load path. The load path is the
    /// `load_path` variable of the running environment, with
    /// `%DATADIR%` expanded, split on ':'. When `filename_p` is set
    /// the module name is used as-is; otherwise `.pk` is appended.
    pub fn resolve_module(&mut self, module: &str, filename_p: bool) -> Option<PathBuf> {
        let load_path = self.load_path()?;
        let datadir =
            std::env::var("POKE_DATADIR").unwrap_or_else(|_| ".".to_string());
        let fixed = load_path.replace("%DATADIR%", &datadir);

        let ext = if filename_p { "" } else { ".pk" };
        for dir in fixed.split(':') {
            if dir.is_empty() {
                continue;
            }
            let candidate = Path::new(dir).join(format!("{}{}", module, ext));
            if std::fs::metadata(&candidate)
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                return Some(candidate);
            }
        }
        None
    }

    /// The current value of the `load_path` variable, read from the
    /// run-time environment through its lexical address.
    fn load_path(&self) -> Option<String> {
        let (_, back, over) = self.env.lookup(Namespace::Main, "load_path")?;
        let val = self.vm.env().lookup(back, over)?;
        self.vm.heap.as_str(val).map(str::to_string)
    }

    /// Resolve and compile a module.
    pub fn load(&mut self, module: &str) -> Result<(), String> {
        let path = self
            .resolve_module(module, false)
            .ok_or_else(|| format!("cannot find module '{}' in the load path", module))?;
        self.compile_file(&path)
    }
}
