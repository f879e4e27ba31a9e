use anyhow::{bail, Result};
use colored::Colorize;
use forma::config::{Config, Layout, Overrides};
use forma::formula::{Dependency, Formula};
use forma::global::cache::{clean_cache, remove_cached_archive};
use forma::installer::{InstallOptions, Interpreter};
use forma::receipt::{find_installed, installed_kegs};
use forma::registry::{formula_files, FormulaIndex};
use crate::cli::{FormaCommand, CLI};

pub fn execute(cli: CLI) -> Result<()> {
    let config = Config::load_global()?;
    let overrides = Overrides {
        prefix: cli.prefix.clone(),
        cache_dir: cli.cache_dir.clone(),
        formula_dirs: cli.formula_dirs.clone(),
    };
    let layout = Layout::resolve(&config, &overrides)?;
    tracing::debug!("layout: {:?}", layout);

    match &cli.command {
        FormaCommand::Audit { name } => {
            return execute_audit(&layout, name.as_deref());
        }
        FormaCommand::Cleanup { name } => {
            return execute_cleanup(&layout, name.as_deref());
        }
        _ => {}
    }

    let index = FormulaIndex::load(&layout.formula_dirs)?;
    match cli.command {
        FormaCommand::Install { name, force, skip_test } => {
            execute_install(&index, &layout, &name, InstallOptions { force, skip_test })
        }
        FormaCommand::Uninstall { name } => {
            execute_uninstall(&index, &layout, &name)
        }
        FormaCommand::Test { name } => {
            execute_test(&index, &layout, &name)
        }
        FormaCommand::Fetch { name } => {
            execute_fetch(&index, &layout, &name)
        }
        FormaCommand::Info { name } => {
            execute_info(&index, &layout, &name)
        }
        FormaCommand::List { all } => {
            execute_list(&index, &layout, all)
        }
        FormaCommand::Audit { .. } | FormaCommand::Cleanup { .. } => Ok(()),
    }
}

pub fn execute_install(
    index: &FormulaIndex,
    layout: &Layout,
    name: &str,
    options: InstallOptions,
) -> Result<()> {
    let interpreter = Interpreter::new(index, layout, options);
    let run = interpreter.install(name);
    if let Some(err) = run.error() {
        println!("{} {} ({})", "==>".red().bold(), name.bold(), run.state);
        bail!("{err}");
    }
    if run.already_installed {
        println!("{} {} is already installed", "==>".yellow().bold(), name.bold());
        return Ok(());
    }
    for dependency in &run.dependencies {
        println!("  {} {} ({})", "dependency".dimmed(), dependency.name, dependency.stage);
    }
    if let Some(keg) = &run.keg {
        println!("{} {} installed to {}", "==>".green().bold(), name.bold(), keg.display());
    }
    for link in &run.links {
        println!("  {} {}", "linked".dimmed(), link.display());
    }
    Ok(())
}

pub fn execute_uninstall(index: &FormulaIndex, layout: &Layout, name: &str) -> Result<()> {
    let interpreter = Interpreter::new(index, layout, InstallOptions::default());
    let keg = interpreter.uninstall(name)?;
    println!("{} Uninstalled {}", "==>".green().bold(), keg.display());
    Ok(())
}

pub fn execute_test(index: &FormulaIndex, layout: &Layout, name: &str) -> Result<()> {
    let interpreter = Interpreter::new(index, layout, InstallOptions::default());
    let report = interpreter.test_installed(name)?;
    println!(
        "{} {}: {} test step(s) passed",
        "==>".green().bold(),
        name.bold(),
        report.passed
    );
    Ok(())
}

pub fn execute_fetch(index: &FormulaIndex, layout: &Layout, name: &str) -> Result<()> {
    let formula = index.lookup(name)?;
    let interpreter = Interpreter::new(index, layout, InstallOptions::default());
    let archive = interpreter.fetch_and_verify(formula)?;
    println!("{} {}", "==>".green().bold(), archive.display());
    println!("  sha256: {}", formula.sha256);
    Ok(())
}

pub fn execute_info(index: &FormulaIndex, layout: &Layout, name: &str) -> Result<()> {
    let formula = index.lookup(name)?;
    println!("{}: {}", formula.name.bold(), formula.version()?);
    println!("{}", formula.desc);
    println!("{}", formula.homepage);
    println!("  license: {}", formula.license);
    println!("  source:  {}", formula.url);
    println!("  sha256:  {}", formula.sha256);
    if !formula.depends_on.is_empty() {
        println!("  depends on:");
        for dependency in &formula.depends_on {
            match dependency {
                Dependency::Platform { os } => println!("    {os} (platform)"),
                Dependency::Formula { name, stage, .. } => println!("    {name} ({stage})"),
            }
        }
    }
    match find_installed(&layout.cellar(), name)? {
        Some((keg, receipt)) => {
            println!("  installed: {} ({})", keg.display(), receipt.version);
        }
        None => {
            println!("  not installed");
        }
    }
    Ok(())
}

pub fn execute_list(index: &FormulaIndex, layout: &Layout, all: bool) -> Result<()> {
    if all {
        if index.is_empty() {
            println!("No formulas");
        }
        for formula in index.iter() {
            println!("{} {}", formula.name, formula.version().unwrap_or_default());
        }
        return Ok(());
    }
    let kegs = installed_kegs(&layout.cellar())?;
    if kegs.is_empty() {
        println!("No formulas installed");
        return Ok(());
    }
    for (_, receipt) in kegs {
        let tested = if receipt.tested { "tested" } else { "untested" };
        println!("{} {} ({tested})", receipt.name, receipt.version);
    }
    Ok(())
}

pub fn execute_audit(layout: &Layout, name: Option<&str>) -> Result<()> {
    let mut checked = 0;
    let mut failures = 0;
    for path in formula_files(&layout.formula_dirs)? {
        let stem = path.file_stem().map(|s| s.to_string_lossy().to_string());
        if name.is_some() && stem.as_deref() != name {
            continue;
        }
        checked += 1;
        match Formula::load(&path) {
            Ok(formula) => {
                println!("{} {}", "ok".green(), formula.name);
            }
            Err(err) => {
                failures += 1;
                println!("{} {}", "error".red().bold(), path.display());
                // report everything, not only the first problem
                let content = std::fs::read_to_string(&path)?;
                match toml::from_str::<Formula>(&content) {
                    Ok(raw) => {
                        for problem in raw.problems() {
                            println!("  - {problem}");
                        }
                    }
                    Err(_) => println!("  - {err}"),
                }
            }
        }
    }
    if let Some(name) = name {
        if checked == 0 {
            bail!("No formula named '{name}'");
        }
    }
    if failures > 0 {
        bail!("{failures} of {checked} formula(s) failed the audit");
    }
    Ok(())
}

pub fn execute_cleanup(layout: &Layout, name: Option<&str>) -> Result<()> {
    let removed = match name {
        Some(name) => remove_cached_archive(&layout.cache_dir, name)?,
        None => clean_cache(&layout.cache_dir)?,
    };
    println!("Removed {removed} cached download(s)");
    Ok(())
}
