mod backend;
mod error;
mod fuse_fs;
mod index;
mod inode;
mod logging;
mod memory_backend;
mod os_backend;
mod paths;


use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use backend::Backend;
use fuse_fs::PolyFS;
use memory_backend::MemoryBackend;
use os_backend::OsBackend;

struct Options {
    mountpoint: PathBuf,
    backend: String,
    root: Option<PathBuf>,
    uid: u32,
    gid: u32,
    verbosity: u8,
}

fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

fn current_gid() -> u32 {
    unsafe { libc::getgid() }
}

fn parse_args(args: &[String]) -> Options {
    let mut backend = "mem".to_string();
    let mut root = None;
    let mut uid = current_uid();
    let mut gid = current_gid();
    let mut verbosity: u8 = 2;
    let mut i = 1;

    fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
        match args.get(i + 1) {
            Some(v) => v,
            None => {
                eprintln!("Error: {} requires a value", flag);
                process::exit(1);
            }
        }
    }

    while i < args.len() {
        match args[i].as_str() {
            "--backend" => {
                backend = value(args, i, "--backend").to_string();
                i += 2;
            }
            "--root" => {
                root = Some(PathBuf::from(value(args, i, "--root")));
                i += 2;
            }
            "--uid" => {
                uid = value(args, i, "--uid").parse().unwrap_or_else(|_| {
                    eprintln!("Error: --uid must be numeric");
                    process::exit(1);
                });
                i += 2;
            }
            "--gid" => {
                gid = value(args, i, "--gid").parse().unwrap_or_else(|_| {
                    eprintln!("Error: --gid must be numeric");
                    process::exit(1);
                });
                i += 2;
            }
            "-v" => {
                verbosity = value(args, i, "-v").parse().unwrap_or_else(|_| {
                    eprintln!("Error: -v must be 0-4");
                    process::exit(1);
                });
                i += 2;
            }
            _ => break,
        }
    }

    if i != args.len() - 1 {
        eprintln!("Error: expected exactly one mountpoint");
        process::exit(1);
    }

    Options {
        mountpoint: PathBuf::from(&args[i]),
        backend,
        root,
        uid,
        gid,
        verbosity,
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        println!("polyfs - mount a pluggable byte backend as a POSIX tree");
        println!();
        println!("Usage: {} [options] <mountpoint>", args[0]);
        println!();
        println!("Options:");
        println!("  --backend mem|os   Backend implementation [default: mem]");
        println!("  --root PATH        Host directory served by the os backend");
        println!("  --uid N            Ownership reported for every inode [default: current]");
        println!("  --gid N            Group reported for every inode [default: current]");
        println!("  -v N               Verbosity 0-4 [default: 2]");
        println!();
        println!("Examples:");
        println!("  {} /mnt/scratch", args[0]);
        println!("  {} --backend os --root /srv/data -v 3 /mnt/data", args[0]);
        return;
    }

    let opts = parse_args(&args);
    logging::init(opts.verbosity);

    let backend: Arc<dyn Backend> = match opts.backend.as_str() {
        "mem" => Arc::new(MemoryBackend::new()),
        "os" => {
            let root = opts.root.unwrap_or_else(|| {
                eprintln!("Error: the os backend requires --root");
                process::exit(1);
            });
            if !root.is_dir() {
                eprintln!("Error: backend root {} is not a directory", root.display());
                process::exit(1);
            }
            Arc::new(OsBackend::new(root))
        }
        other => {
            eprintln!("Error: unknown backend {:?} (expected mem or os)", other);
            process::exit(1);
        }
    };

    let fs = match PolyFS::new(backend, "/", opts.uid, opts.gid) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("Index build failed: {}", e);
            process::exit(1);
        }
    };

    let options = vec![
        fuser::MountOption::RW,
        fuser::MountOption::FSName("polyfs".to_string()),
        fuser::MountOption::AutoUnmount,
    ];

    if let Err(e) = fuser::mount2(fs, &opts.mountpoint, &options) {
        eprintln!("Mount failed: {}", e);
        process::exit(1);
    }
}
