use clap::{Arg, ArgAction, ArgMatches, Command};
use jvm_structurer::import::{ImportError, import_code};
use jvm_structurer::instruction::MethodSignature;
use jvm_structurer::types::{BasicHierarchy, ClassHierarchy, ClassInfo};
use jvm_structurer::{DecompilerOptions, MethodDecompileError, decompile_method};
use noak::{
    AccessFlags, MStr,
    error::DecodeError,
    reader::{Class, Method, attributes::Code, cpool::ConstantPool},
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
enum ClassDecompileError {
    #[error("Failed to read {path}: {error}")]
    Io {
        path: String,
        error: std::io::Error,
    },

    #[error("Failed to parse class file: {0}")]
    Noak(#[from] DecodeError),

    #[error("In method `{name}`: {error}")]
    Method {
        name: String,
        error: MethodDecompileError,
    },
}

fn cli() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about("Recovers structured control flow from JVM class files")
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Log debug messages"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Log everything, including every structuring step"),
        )
        .arg(
            Arg::new("method")
                .long("method")
                .action(ArgAction::Set)
                .value_name("NAME")
                .help("Only decompile methods with this name"),
        )
        .arg(
            Arg::new("no-finally")
                .long("no-finally")
                .action(ArgAction::SetTrue)
                .help("Keep duplicated finally code as catch-all handlers"),
        )
        .arg(
            Arg::new("no-synchronized")
                .long("no-synchronized")
                .action(ArgAction::SetTrue)
                .help("Keep monitor instructions instead of synchronized blocks"),
        )
        .arg(
            Arg::new("raw")
                .long("raw")
                .action(ArgAction::SetTrue)
                .help("Skip simplification after structuring"),
        )
        .arg(
            Arg::new("files")
                .value_name("CLASS_FILE")
                .value_parser(clap::value_parser!(PathBuf))
                .action(ArgAction::Append)
                .required(true),
        )
}

fn init_logger(args: &ArgMatches) {
    let env = env_logger::Env::new()
        .filter_or("JVM_STRUCTURER_LOG", "warn")
        .write_style("JVM_STRUCTURER_LOG_STYLE");

    let mut builder = env_logger::Builder::from_env(env);
    if args.get_flag("verbose") {
        builder.filter_level(log::LevelFilter::Trace);
    } else if args.get_flag("debug") {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

fn name_of(pool: &ConstantPool<'_>, method: &Method<'_>) -> String {
    pool.retrieve(method.name())
        .map(|name| name.display().to_string())
        .unwrap_or_else(|_| "??".to_string())
}

fn decompile_method_in(
    pool: &ConstantPool<'_>,
    class_name: &str,
    method: &Method<'_>,
    hierarchy: &dyn ClassHierarchy,
    options: &DecompilerOptions,
) -> Result<Option<String>, MethodDecompileError> {
    let Some(code): Option<Code> = method
        .attributes()
        .find_attribute(pool)
        .map_err(ImportError::from)?
    else {
        // Abstract and native methods.
        return Ok(None);
    };

    let name: &MStr = pool.retrieve(method.name()).map_err(ImportError::from)?;
    let descriptor: &MStr = pool.retrieve(method.descriptor()).map_err(ImportError::from)?;
    let signature = MethodSignature::new(
        class_name,
        &name.display().to_string(),
        &descriptor.display().to_string(),
        method.access_flags().contains(AccessFlags::STATIC),
    );

    let body = import_code(pool, signature, &code)?;
    let decompiled = decompile_method(&body, hierarchy, options)?;
    Ok(Some(decompiled.to_string()))
}

fn read_class_file(path: &Path) -> Result<Vec<u8>, ClassDecompileError> {
    std::fs::read(path).map_err(|error| ClassDecompileError::Io {
        path: path.display().to_string(),
        error,
    })
}

/// Makes the class known to the type lattice.
fn register_class(
    hierarchy: &mut BasicHierarchy,
    raw_bytes: &[u8],
) -> Result<(), ClassDecompileError> {
    let class = Class::new(raw_bytes)?;
    let pool = class.pool();
    let name = pool.retrieve(class.this_class())?.name.display().to_string();

    let superclass = match class.super_class() {
        Some(index) => Some(pool.retrieve(index)?.name.display().to_string()),
        None => None,
    };
    let mut interfaces = Vec::new();
    for interface in class.interfaces() {
        interfaces.push(pool.retrieve(interface?)?.name.display().to_string());
    }

    let is_interface = class.access_flags().contains(AccessFlags::INTERFACE);
    hierarchy.insert(
        &name,
        ClassInfo {
            superclass: superclass.filter(|_| !is_interface),
            interfaces,
            is_interface,
        },
    );
    Ok(())
}

fn decompile_class_file(
    raw_bytes: &[u8],
    hierarchy: &dyn ClassHierarchy,
    filter: Option<&str>,
    options: &DecompilerOptions,
) -> Result<(), ClassDecompileError> {
    let class = Class::new(raw_bytes)?;
    let pool = class.pool();
    let class_name = pool.retrieve(class.this_class())?.name.display().to_string();

    println!("// class {class_name}");
    for method in class.methods() {
        let method = method?;
        let name = name_of(pool, &method);
        if filter.is_some_and(|filter| filter != name) {
            continue;
        }

        match decompile_method_in(pool, &class_name, &method, hierarchy, options) {
            Ok(Some(text)) => {
                println!("{name} {{");
                for line in text.lines() {
                    println!("    {line}");
                }
                println!("}}");
            }
            Ok(None) => println!("{name};"),
            Err(error) => {
                log::warn!("{class_name}: {}", ClassDecompileError::Method {
                    name: name.clone(),
                    error,
                });
                println!("{name} {{ /* undecompilable */ }}");
            }
        }
    }
    Ok(())
}

fn main() {
    let args = cli().get_matches();
    init_logger(&args);

    let options = DecompilerOptions {
        merge_finally: !args.get_flag("no-finally"),
        detect_synchronized: !args.get_flag("no-synchronized"),
        simplify: !args.get_flag("raw"),
    };
    let filter = args.get_one::<String>("method").map(String::as_str);

    let start = Instant::now();
    let mut failed = false;
    let mut files = Vec::new();
    for path in args.get_many::<PathBuf>("files").into_iter().flatten() {
        match read_class_file(path) {
            Ok(raw_bytes) => files.push((path, raw_bytes)),
            Err(e) => {
                log::error!("{e}");
                failed = true;
            }
        }
    }

    // Every input class is registered before any method is decompiled.
    let mut hierarchy = BasicHierarchy::new();
    for (path, raw_bytes) in &files {
        if let Err(e) = register_class(&mut hierarchy, raw_bytes) {
            log::debug!("{}: not registered: {e}", path.display());
        }
    }

    for (path, raw_bytes) in &files {
        if let Err(e) = decompile_class_file(raw_bytes, &hierarchy, filter, &options) {
            log::error!("{}: {e}", path.display());
            failed = true;
        }
    }
    log::info!("elapsed {:?}", start.elapsed());

    if failed {
        std::process::exit(1);
    }
}
