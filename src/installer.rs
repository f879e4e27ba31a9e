//! The formula interpreter: resolve dependencies, fetch and verify source, run
//! the install recipe, run the test recipe.
//!
//! A run moves through [`InstallState`] strictly in order. Any error moves it
//! to [`InstallState::Failed`] and removes the keg, so a failed run never
//! leaves an installed artifact registered.

use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use crate::config::Layout;
use crate::error::{FormaError, Result};
use crate::fetch::{extract, fetch_verified};
use crate::global::cache::archive_file_name;
use crate::formula::{Dependency, Formula, Stage};
use crate::link::{link_keg, unlink_keg};
use crate::receipt::{find_installed, InstallReceipt};
use crate::recipe::{run_install_recipe, run_test_recipe, StepContext, TestReport};
use crate::registry::FormulaIndex;
use crate::util::{current_os, find_on_path, is_empty_dir};

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Reinstall even if the same version and digest is registered.
    pub force: bool,
    /// Skip the test recipe (the run goes `Installed -> Done`).
    pub skip_test: bool,
}

#[derive(Debug)]
pub enum InstallState {
    Pending,
    DependenciesResolved,
    SourceVerified,
    Installed,
    Tested,
    Done,
    Failed(FormaError),
}

impl InstallState {
    pub fn label(&self) -> &'static str {
        match self {
            InstallState::Pending => "Pending",
            InstallState::DependenciesResolved => "DependenciesResolved",
            InstallState::SourceVerified => "SourceVerified",
            InstallState::Installed => "Installed",
            InstallState::Tested => "Tested",
            InstallState::Done => "Done",
            InstallState::Failed(_) => "Failed",
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallState::Failed(err) => write!(f, "Failed({})", err.kind()),
            other => f.write_str(other.label()),
        }
    }
}

/// Record of one workflow run.
#[derive(Debug)]
pub struct InstallRun {
    pub formula: String,
    pub state: InstallState,
    /// Every state the run passed through, `Pending` first.
    pub history: Vec<&'static str>,
    pub keg: Option<PathBuf>,
    /// The formula was already registered; no step ran.
    pub already_installed: bool,
    pub dependencies: Vec<DependencyHandle>,
    pub links: Vec<PathBuf>,
}

impl InstallRun {
    fn new(formula: &str) -> Self {
        InstallRun {
            formula: formula.to_string(),
            state: InstallState::Pending,
            history: vec![InstallState::Pending.label()],
            keg: None,
            already_installed: false,
            dependencies: Vec::new(),
            links: Vec::new(),
        }
    }

    fn advance(&mut self, next: InstallState) {
        info!("{}: {} -> {}", self.formula, self.state, next);
        self.history.push(next.label());
        self.state = next;
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.state, InstallState::Done)
    }

    /// The error that ended the run, if it failed.
    pub fn error(&self) -> Option<&FormaError> {
        match &self.state {
            InstallState::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the run ever reached `state` (by label).
    pub fn reached(&self, label: &str) -> bool {
        self.history.contains(&label)
    }
}

/// Where a resolved dependency comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyOrigin {
    /// A registered keg in the cellar.
    Keg(PathBuf),
    /// An executable already on the host `PATH`.
    Host(PathBuf),
    /// A satisfied platform requirement.
    Platform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyHandle {
    pub name: String,
    pub stage: Stage,
    pub origin: DependencyOrigin,
}

impl DependencyHandle {
    /// Directory to put on `PATH` so recipe steps can use the dependency.
    pub fn bin_dir(&self) -> Option<PathBuf> {
        match &self.origin {
            DependencyOrigin::Keg(keg) => Some(keg.join("bin")),
            DependencyOrigin::Host(exe) => exe.parent().map(Path::to_path_buf),
            DependencyOrigin::Platform => None,
        }
    }
}

/// Executes the formula workflow against one layout and one index.
pub struct Interpreter<'a> {
    index: &'a FormulaIndex,
    layout: &'a Layout,
    options: InstallOptions,
}

impl<'a> Interpreter<'a> {
    pub fn new(index: &'a FormulaIndex, layout: &'a Layout, options: InstallOptions) -> Self {
        Interpreter { index, layout, options }
    }

    /// Runs the full workflow for `name` and returns the finished run.
    ///
    /// The returned run is always in a terminal state.
    pub fn install(&self, name: &str) -> InstallRun {
        let mut run = InstallRun::new(name);
        let mut visiting = Vec::new();
        let result = self
            .index
            .lookup(name)
            .and_then(|formula| self.drive(formula, &mut run, &mut visiting, !self.options.skip_test));
        if let Err(err) = result {
            warn!("{name}: {err}");
            run.advance(InstallState::Failed(err));
        }
        run
    }

    /// Ensures every `depends_on` entry is present on the host, installing
    /// formula dependencies from the index when needed.
    ///
    /// # Errors
    /// Returns [`FormaError::DependencyResolution`] if a dependency cannot be
    /// located or built.
    pub fn resolve_dependencies(&self, formula: &Formula) -> Result<Vec<DependencyHandle>> {
        let mut visiting = vec![formula.name.clone()];
        self.resolve_with(formula, &mut visiting)
    }

    /// Downloads the formula's source and verifies its SHA-256.
    ///
    /// # Errors
    /// [`FormaError::Network`] if the download fails,
    /// [`FormaError::IntegrityMismatch`] if the digest differs.
    pub fn fetch_and_verify(&self, formula: &Formula) -> Result<PathBuf> {
        let version = formula.version()?;
        fetch_verified(
            &formula.name,
            &version,
            &formula.url,
            &formula.sha256,
            &self.layout.cache_dir,
        )
    }

    /// Runs the install recipe inside `source` and returns the keg path.
    ///
    /// Registered dependency kegs are put on `PATH`. The keg is removed again
    /// if a step fails.
    ///
    /// # Errors
    /// Returns [`FormaError::BuildStep`] for the first failing step.
    pub fn run_install(&self, formula: &Formula, source: &Path) -> Result<PathBuf> {
        let handles = self.registered_dependencies(formula)?;
        self.install_into_keg(formula, source, &handles)
    }

    /// Runs the test recipe against an installed keg.
    ///
    /// # Errors
    /// Returns [`FormaError::TestAssertion`] for the first failing step.
    pub fn run_test(&self, formula: &Formula, keg: &Path) -> Result<TestReport> {
        let ctx = StepContext {
            name: formula.name.clone(),
            version: formula.version()?,
            prefix: keg.to_path_buf(),
            source: keg.to_path_buf(),
            path_prepend: self.path_for(&self.registered_dependencies(formula)?, false),
        };
        // tests run in a scratch directory, never inside the keg
        let scratch = tempfile::Builder::new().prefix("forma-test-").tempdir()?;
        let report = run_test_recipe(&formula.test, &ctx, scratch.path())?;
        debug!("{}: {} test step(s) passed", formula.name, report.passed);
        Ok(report)
    }

    /// Runs the test recipe of an already registered formula.
    pub fn test_installed(&self, name: &str) -> Result<TestReport> {
        let formula = self.index.lookup(name)?;
        let (keg, _) = find_installed(&self.layout.cellar(), name)?
            .ok_or_else(|| FormaError::NotInstalled(name.to_string()))?;
        self.run_test(formula, &keg)
    }

    /// Removes the links and the keg of a registered formula.
    ///
    /// Returns the removed keg path.
    pub fn uninstall(&self, name: &str) -> Result<PathBuf> {
        let (keg, _) = find_installed(&self.layout.cellar(), name)?
            .ok_or_else(|| FormaError::NotInstalled(name.to_string()))?;
        let removed = unlink_keg(&keg, &self.layout.bin_dir())?;
        debug!("{name}: removed {removed} link(s)");
        std::fs::remove_dir_all(&keg)?;
        let rack = self.layout.cellar().join(name);
        if is_empty_dir(&rack) && rack.exists() {
            std::fs::remove_dir(&rack)?;
        }
        info!("{name}: uninstalled {}", keg.display());
        Ok(keg)
    }

    fn drive(
        &self,
        formula: &Formula,
        run: &mut InstallRun,
        visiting: &mut Vec<String>,
        with_test: bool,
    ) -> Result<()> {
        let version = formula.version()?;
        if !self.options.force {
            if let Some((keg, receipt)) = find_installed(&self.layout.cellar(), &formula.name)? {
                if receipt.version == version && receipt.sha256 == formula.sha256 {
                    info!("{} {} is already installed", formula.name, version);
                    run.already_installed = true;
                    run.keg = Some(keg);
                    run.advance(InstallState::Done);
                    return Ok(());
                }
            }
        }
        self.layout.ensure_dirs()?;

        visiting.push(formula.name.clone());
        let handles = self.resolve_with(formula, visiting);
        visiting.pop();
        run.dependencies = handles?;
        run.advance(InstallState::DependenciesResolved);

        let archive = self.fetch_and_verify(formula)?;
        run.advance(InstallState::SourceVerified);

        let staging = tempfile::Builder::new().prefix("forma-build-").tempdir()?;
        let source = extract(&archive, archive_file_name(&formula.url)?, staging.path())?;
        let keg = self.install_into_keg(formula, &source, &run.dependencies)?;
        run.keg = Some(keg.clone());
        run.advance(InstallState::Installed);

        let finished = self.finish(formula, &version, &keg, run, with_test);
        if finished.is_err() {
            if let Err(e) = unlink_keg(&keg, &self.layout.bin_dir()) {
                warn!("could not remove links into {}: {e}", keg.display());
            }
            rollback(&keg);
            run.keg = None;
            run.links.clear();
        }
        finished
    }

    /// Tests, registers and links an installed keg.
    fn finish(
        &self,
        formula: &Formula,
        version: &str,
        keg: &Path,
        run: &mut InstallRun,
        with_test: bool,
    ) -> Result<()> {
        if with_test {
            self.run_test(formula, keg)?;
            run.advance(InstallState::Tested);
        }

        let mut receipt = InstallReceipt::new(&formula.name, version, &formula.sha256, &formula.url);
        receipt.dependencies = run.dependencies.iter().map(|d| d.name.clone()).collect();
        receipt.tested = with_test;
        receipt.save(keg)?;
        run.links = link_keg(keg, &self.layout.bin_dir())?;
        run.advance(InstallState::Done);
        Ok(())
    }

    fn install_into_keg(
        &self,
        formula: &Formula,
        source: &Path,
        handles: &[DependencyHandle],
    ) -> Result<PathBuf> {
        let version = formula.version()?;
        let keg = self.layout.keg_path(&formula.name, &version);
        if keg.exists() {
            // leftovers of an unregistered or forced install
            unlink_keg(&keg, &self.layout.bin_dir())?;
            std::fs::remove_dir_all(&keg)?;
        }
        std::fs::create_dir_all(&keg)?;

        let ctx = StepContext {
            name: formula.name.clone(),
            version,
            prefix: keg.clone(),
            source: source.to_path_buf(),
            path_prepend: self.path_for(handles, true),
        };
        let result = run_install_recipe(&formula.install, &ctx, source).and_then(|count| {
            if is_empty_dir(&keg) {
                Err(FormaError::BuildStep {
                    step: count,
                    command: formula
                        .install
                        .last()
                        .map(|s| ctx.interpolate(&s.command_line()))
                        .unwrap_or_default(),
                    exit_code: Some(0),
                    detail: format!("nothing was installed into {}", keg.display()),
                })
            } else {
                Ok(count)
            }
        });
        match result {
            Ok(count) => {
                info!("{}: {count} install step(s) completed", formula.name);
                Ok(keg)
            }
            Err(err) => {
                rollback(&keg);
                Err(err)
            }
        }
    }

    fn resolve_with(
        &self,
        formula: &Formula,
        visiting: &mut Vec<String>,
    ) -> Result<Vec<DependencyHandle>> {
        let mut handles = Vec::with_capacity(formula.depends_on.len());
        for dependency in &formula.depends_on {
            let handle = match dependency {
                Dependency::Platform { os } => {
                    if os != current_os() {
                        return Err(FormaError::DependencyResolution {
                            formula: formula.name.clone(),
                            dependency: os.clone(),
                            reason: format!("requires {os}, but this host runs {}", current_os()),
                        });
                    }
                    DependencyHandle {
                        name: os.clone(),
                        stage: Stage::Runtime,
                        origin: DependencyOrigin::Platform,
                    }
                }
                Dependency::Formula { name, stage, probe } => {
                    self.resolve_formula_dependency(formula, name, *stage, probe.as_deref(), visiting)?
                }
            };
            debug!("{}: dependency {} satisfied by {:?}", formula.name, handle.name, handle.origin);
            handles.push(handle);
        }
        Ok(handles)
    }

    fn resolve_formula_dependency(
        &self,
        formula: &Formula,
        name: &str,
        stage: Stage,
        probe: Option<&str>,
        visiting: &mut Vec<String>,
    ) -> Result<DependencyHandle> {
        let unresolved = |reason: String| FormaError::DependencyResolution {
            formula: formula.name.clone(),
            dependency: name.to_string(),
            reason,
        };

        if visiting.iter().any(|v| v == name) {
            let mut cycle = visiting.clone();
            cycle.push(name.to_string());
            return Err(unresolved(format!("circular dependency {}", cycle.join(" -> "))));
        }

        if let Some((keg, _)) = find_installed(&self.layout.cellar(), name)? {
            return Ok(DependencyHandle {
                name: name.to_string(),
                stage,
                origin: DependencyOrigin::Keg(keg),
            });
        }

        if let Some(exe) = probe.and_then(find_on_path) {
            return Ok(DependencyHandle {
                name: name.to_string(),
                stage,
                origin: DependencyOrigin::Host(exe),
            });
        }

        let Some(dep_formula) = self.index.get(name) else {
            let reason = match probe {
                Some(probe) => format!("'{probe}' is not on PATH and no formula named '{name}' exists"),
                None => format!("no formula named '{name}' exists"),
            };
            return Err(unresolved(reason));
        };

        info!("{}: installing dependency {name}", formula.name);
        let mut dep_run = InstallRun::new(name);
        self.drive(dep_formula, &mut dep_run, visiting, false)
            .map_err(|e| match e {
                // keep the innermost dependency error as is
                err @ FormaError::DependencyResolution { .. } => err,
                other => unresolved(other.to_string()),
            })?;
        let keg = dep_run
            .keg
            .ok_or_else(|| unresolved("installed without a keg".to_string()))?;
        Ok(DependencyHandle {
            name: name.to_string(),
            stage,
            origin: DependencyOrigin::Keg(keg),
        })
    }

    /// Handles for dependencies that are already satisfied, without installing anything.
    fn registered_dependencies(&self, formula: &Formula) -> Result<Vec<DependencyHandle>> {
        let mut handles = Vec::new();
        for dependency in &formula.depends_on {
            if let Dependency::Formula { name, stage, probe } = dependency {
                if let Some((keg, _)) = find_installed(&self.layout.cellar(), name)? {
                    handles.push(DependencyHandle {
                        name: name.clone(),
                        stage: *stage,
                        origin: DependencyOrigin::Keg(keg),
                    });
                } else if let Some(exe) = probe.as_deref().and_then(find_on_path) {
                    handles.push(DependencyHandle {
                        name: name.clone(),
                        stage: *stage,
                        origin: DependencyOrigin::Host(exe),
                    });
                }
            }
        }
        Ok(handles)
    }

    /// `PATH` additions for recipe steps. Build-only dependencies are visible
    /// to install steps but not to tests.
    fn path_for(&self, handles: &[DependencyHandle], building: bool) -> Vec<PathBuf> {
        handles
            .iter()
            .filter(|h| building || h.stage == Stage::Runtime)
            .filter_map(DependencyHandle::bin_dir)
            .collect()
    }
}

fn rollback(keg: &Path) {
    if keg.exists() {
        warn!("removing incomplete keg {}", keg.display());
        if let Err(e) = std::fs::remove_dir_all(keg) {
            warn!("could not remove {}: {e}", keg.display());
        }
    }
}
