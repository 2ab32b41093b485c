//! Thin AFF4 imager CLI: create, list, cat and inspect container members.
//!
//! Grounded on the teacher's `main.rs`, scaled from its single builder-style
//! `Command` to `clap::Parser` derive subcommands for the richer verb set
//! (create/ls/info/cat) this crate's volume layer supports.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use aff4::context::{DEFAULT_CHUNKS_PER_SEGMENT, DEFAULT_CHUNK_SIZE};
use aff4::dir_volume::DirVolume;
use aff4::factory::open_stream;
use aff4::image::{CompressionMethod, ImageStream};
use aff4::rdf::RdfValue;
use aff4::resolver::{
    AFF4_CATEGORY, AFF4_CHUNKS_IN_SEGMENT, AFF4_CHUNK_SIZE, AFF4_COMPRESSION_METHOD,
    AFF4_ORIGINAL_FILENAME, AFF4_SIZE, AFF4_STORED, RDF_TYPE, TYPE_IMAGE_STREAM,
};
use aff4::volume::{SharedVolume, VolumeGroup};
use aff4::zip::ZipVolume;
use aff4::{Resolver, Urn};

#[derive(Parser)]
#[command(name = "aff4imager", version, about = "Create, list, inspect and extract AFF4 forensic containers.")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(ValueEnum, Clone, Copy)]
enum CompressionArg {
    Stored,
    Zlib,
    Deflate,
    Snappy,
    Lz4,
}

impl From<CompressionArg> for CompressionMethod {
    fn from(value: CompressionArg) -> Self {
        match value {
            CompressionArg::Stored => CompressionMethod::Stored,
            CompressionArg::Zlib => CompressionMethod::Zlib,
            CompressionArg::Deflate => CompressionMethod::Deflate,
            CompressionArg::Snappy => CompressionMethod::Snappy,
            CompressionArg::Lz4 => CompressionMethod::Lz4,
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Image a source file into a new AFF4 volume.
    Create {
        /// Output volume path.
        #[arg(short = 'o', long)]
        volume: PathBuf,
        /// Source file to image.
        #[arg(short = 'i', long)]
        source: PathBuf,
        /// Write a directory-backed volume instead of ZIP.
        #[arg(long)]
        dir: bool,
        /// Chunk size in bytes.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u32,
        /// Chunks per bevy.
        #[arg(long, default_value_t = DEFAULT_CHUNKS_PER_SEGMENT)]
        chunks_per_segment: u32,
        /// Per-chunk compression method.
        #[arg(long, value_enum, default_value_t = CompressionArg::Zlib)]
        compression: CompressionArg,
    },
    /// List the members of a volume.
    Ls {
        volume: PathBuf,
    },
    /// Print the resolver metadata recorded for a URN.
    Info {
        volume: PathBuf,
        urn: String,
    },
    /// Dump a stream's contents to stdout.
    Cat {
        volume: PathBuf,
        urn: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        size: Option<u64>,
    },
}

/// Opens an existing volume read-only and loads its `information.turtle`
/// into a fresh resolver, ready for [`open_stream`] dispatch.
fn open_existing_group(path: &Path) -> io::Result<VolumeGroup> {
    let mut resolver = Resolver::new();
    let shared: SharedVolume = if path.is_dir() {
        Rc::new(RefCell::new(DirVolume::open(path).map_err(io::Error::from)?))
    } else {
        Rc::new(RefCell::new(ZipVolume::open(path, false).map_err(io::Error::from)?))
    };
    if shared.borrow().has_member("information.turtle") {
        let turtle = shared
            .borrow_mut()
            .read_member("information.turtle")
            .map_err(io::Error::from)?;
        resolver.load_from_turtle(&turtle[..]).map_err(io::Error::from)?;
    }
    let mut group = VolumeGroup::new(resolver);
    group.add_volume(shared);
    Ok(group)
}

fn run_create(
    volume: PathBuf,
    source: PathBuf,
    dir: bool,
    chunk_size: u32,
    chunks_per_segment: u32,
    compression: CompressionMethod,
) -> io::Result<()> {
    let volume_urn = Urn::new(format!("aff4://{}", Uuid::new_v4()));
    let image_urn = volume_urn.append(
        source.file_name().and_then(|n| n.to_str()).unwrap_or("image.dd"),
    );

    let shared: SharedVolume = if dir {
        Rc::new(RefCell::new(
            DirVolume::create(&volume, volume_urn.clone()).map_err(io::Error::from)?,
        ))
    } else {
        Rc::new(RefCell::new(
            ZipVolume::create(&volume, volume_urn.clone()).map_err(io::Error::from)?,
        ))
    };

    let mut image = ImageStream::create(
        image_urn.clone(),
        shared.clone(),
        chunk_size,
        chunks_per_segment,
        compression,
    );
    let mut src = File::open(&source)?;
    let mut buf = vec![0u8; 1024 * 1024];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        image.write_all(&buf[..n])?;
        total += n as u64;
    }
    image.finalize().map_err(io::Error::from)?;

    let mut resolver = Resolver::new();
    resolver.set(&image_urn, RDF_TYPE, RdfValue::Urn(Urn::new(TYPE_IMAGE_STREAM)), true);
    resolver.set(&image_urn, AFF4_STORED, RdfValue::Urn(volume_urn.clone()), true);
    resolver.set(&image_urn, AFF4_SIZE, RdfValue::XsdInteger(total as i64), true);
    resolver.set(&image_urn, AFF4_CHUNK_SIZE, RdfValue::XsdInteger(chunk_size as i64), true);
    resolver.set(
        &image_urn,
        AFF4_CHUNKS_IN_SEGMENT,
        RdfValue::XsdInteger(chunks_per_segment as i64),
        true,
    );
    resolver.set(
        &image_urn,
        AFF4_COMPRESSION_METHOD,
        RdfValue::Urn(Urn::new(compression.to_uri())),
        true,
    );
    resolver.set(
        &image_urn,
        AFF4_ORIGINAL_FILENAME,
        RdfValue::XsdString(source.display().to_string()),
        true,
    );
    resolver.set(&image_urn, AFF4_CATEGORY, RdfValue::XsdString("image".to_string()), true);

    shared.borrow_mut().flush(&resolver).map_err(io::Error::from)?;

    println!("created {} ({} bytes) in {}", image_urn, total, volume.display());
    Ok(())
}

fn run_ls(volume: PathBuf) -> io::Result<()> {
    let group = open_existing_group(&volume)?;
    let mut names: Vec<String> = group.volumes()[0].borrow().member_names();
    names.sort();
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn run_info(volume: PathBuf, urn: String) -> io::Result<()> {
    let urn = Urn::new(urn);
    let group = open_existing_group(&volume)?;
    for predicate in [
        RDF_TYPE,
        AFF4_SIZE,
        AFF4_CHUNK_SIZE,
        AFF4_CHUNKS_IN_SEGMENT,
        AFF4_COMPRESSION_METHOD,
        AFF4_STORED,
        AFF4_ORIGINAL_FILENAME,
    ] {
        for value in group.resolver.get_all(&urn, predicate) {
            println!("{predicate} = {}", value.serialize_to_string());
        }
    }
    Ok(())
}

fn run_cat(volume: PathBuf, urn: String, offset: u64, size: Option<u64>) -> io::Result<()> {
    let urn = Urn::new(urn);
    let mut group = open_existing_group(&volume)?;
    let stream = open_stream(&mut group, &urn).map_err(io::Error::from)?;
    let mut stream = stream.borrow_mut();
    stream.seek(SeekFrom::Start(offset))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match size {
        Some(n) => {
            let mut remaining = n;
            let mut buf = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let want = std::cmp::min(remaining, buf.len() as u64) as usize;
                let read = stream.read(&mut buf[..want])?;
                if read == 0 {
                    break;
                }
                out.write_all(&buf[..read])?;
                remaining -= read as u64;
            }
        }
        None => {
            io::copy(&mut *stream, &mut out)?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Cmd::Create {
            volume,
            source,
            dir,
            chunk_size,
            chunks_per_segment,
            compression,
        } => run_create(volume, source, dir, chunk_size, chunks_per_segment, compression.into()),
        Cmd::Ls { volume } => run_ls(volume),
        Cmd::Info { volume, urn } => run_info(volume, urn),
        Cmd::Cat { volume, urn, offset, size } => run_cat(volume, urn, offset, size),
    };

    if let Err(e) = result {
        eprintln!("aff4imager: {e}");
        std::process::exit(1);
    }
}
