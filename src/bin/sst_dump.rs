//! sst_dump
//!
//! Command-line inspector for table files.

use anyhow::{bail, Context};
use blocktable::config::{ExtentOptions, ReadOptions, TableOptions};
use blocktable::filter::BloomFilterPolicy;
use blocktable::sstable::{InternalIterator, TableReader};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;

/// Inspect a block-based table file
#[derive(Parser, Debug)]
#[command(name = "sst_dump")]
#[command(about = "Print, scan and verify block-based table files")]
struct Args {
    /// Table file to inspect
    file: String,

    /// Print every entry
    #[arg(long)]
    scan: bool,

    /// Print table properties
    #[arg(long)]
    props: bool,

    /// Print footer and properties as JSON
    #[arg(long)]
    json: bool,

    /// Read every block and verify its checksum
    #[arg(long)]
    verify: bool,

    /// Print every section of the table
    #[arg(long)]
    dump: bool,

    /// Extent size when the table lives in a fixed-size extent
    #[arg(long)]
    extent_size: Option<u64>,

    /// Stop scanning after this many entries
    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut options = TableOptions::default()
        .filter_policy(Arc::new(BloomFilterPolicy::default()))
        .prefetch_index_and_filter(false);
    if let Some(extent_size) = args.extent_size {
        options = options.extent(ExtentOptions { extent_size, next_extent: 0 });
    }

    let reader =
        TableReader::open_path(&args.file, options).with_context(|| format!("failed to open table {}", args.file))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if args.json {
        let doc = serde_json::json!({
            "file": args.file,
            "file_size": reader.file_size(),
            "footer": reader.footer(),
            "properties": reader.table_properties(),
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&doc)?)?;
    } else {
        let footer = reader.footer();
        writeln!(out, "from [{}] to []", args.file)?;
        writeln!(out, "file size: {}", reader.file_size())?;
        writeln!(out, "format version: {}", footer.version)?;
        writeln!(out, "checksum: {:?}", footer.checksum)?;
        writeln!(out, "index type: {:?}", reader.index_type())?;
        if args.props {
            let props = reader.table_properties();
            writeln!(out, "Table Properties:")?;
            writeln!(out, "  # data blocks: {}", props.num_data_blocks)?;
            writeln!(out, "  # entries: {}", props.num_entries)?;
            writeln!(out, "  # range deletions: {}", props.num_range_deletions)?;
            writeln!(out, "  raw key size: {}", props.raw_key_size)?;
            writeln!(out, "  raw value size: {}", props.raw_value_size)?;
            writeln!(out, "  data block size: {}", props.data_size)?;
            writeln!(out, "  index block size: {}", props.index_size)?;
            writeln!(out, "  filter block size: {}", props.filter_size)?;
            writeln!(out, "  filter policy name: {}", props.filter_policy_name)?;
            writeln!(out, "  comparator name: {}", props.comparator_name)?;
            writeln!(out, "  prefix extractor name: {}", props.prefix_extractor_name)?;
            writeln!(out, "  compression: {}", props.compression_name)?;
        }
    }

    if args.dump {
        reader.dump_table(&mut out)?;
    }

    if args.scan {
        let mut iter = reader.iter(&ReadOptions::default().total_order_seek(true).fill_cache(false))?;
        iter.seek_to_first();
        let mut count = 0usize;
        while iter.valid() && args.limit.map_or(true, |limit| count < limit) {
            writeln!(out, "'{}' => '{}'", iter.key().escape_ascii(), iter.value().escape_ascii())?;
            count += 1;
            iter.next();
        }
        iter.status()?;
        log::info!("Scanned {} entries", count);
    }

    if args.verify {
        match reader.verify_checksums() {
            Ok(()) => writeln!(out, "The file is ok")?,
            Err(e) => bail!("{} is corrupted: {}", args.file, e),
        }
    }
    Ok(())
}
