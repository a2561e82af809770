// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Zigbee OTA image utility.
 *
 * Copyright (c) 2024 Code Construct
 */

use anyhow::{bail, Context};
use argh::FromArgs;
use enumset::{EnumSet, EnumSetType};
use std::fmt::Write as _;
use std::io::Write;

#[allow(unused)]
use log::{debug, info, warn};

use zigbee_ota::{Eui64, ImageId};
use zigbee_ota_fw::{
    build_image, enumerate_tags, read_header, tag_offset_and_size, ImageRead,
    OtaHeader, Tags, TAG_ECDSA_SIGNATURE, TAG_ECDSA_SIGNING_CERT,
    TAG_OVERHEAD, TAG_UPGRADE_IMAGE,
};

fn comma_separated<T: EnumSetType + std::fmt::Debug>(e: EnumSet<T>) -> String {
    let mut s = String::new();
    for (i, v) in e.iter().enumerate() {
        let _ = write!(s, "{}{:?}", if i == 0 { "" } else { "," }, v);
    }
    s
}

fn tag_name(id: u16) -> &'static str {
    match id {
        TAG_UPGRADE_IMAGE => "upgrade image",
        TAG_ECDSA_SIGNATURE => "ECDSA signature",
        TAG_ECDSA_SIGNING_CERT => "ECDSA signing certificate",
        0xf000..=0xffff => "manufacturer specific",
        _ => "unknown",
    }
}

/// Parses decimal or 0x-prefixed hex
fn parse_num(s: &str) -> Result<u64, String> {
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u64::from_str_radix(h, 16),
        None => s.parse(),
    };
    r.map_err(|e| format!("bad number '{s}': {e}"))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let v = parse_num(s)?;
    u16::try_from(v).map_err(|_| format!("'{s}' exceeds 16 bits"))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let v = parse_num(s)?;
    u32::try_from(v).map_err(|_| format!("'{s}' exceeds 32 bits"))
}

/// Parses a most significant byte first EUI64, with optional separators
fn parse_eui64(s: &str) -> Result<Eui64, String> {
    let digits: String =
        s.chars().filter(|c| *c != ':' && *c != '-').collect();
    let b = hex::decode(&digits).map_err(|e| format!("bad EUI64 '{s}': {e}"))?;
    Eui64::from_be_slice(&b).ok_or_else(|| format!("EUI64 '{s}' isn't 8 bytes"))
}

/// Parses `ID:FILE`
fn parse_tag_arg(s: &str) -> Result<(u16, String), String> {
    let (id, file) = s
        .split_once(':')
        .ok_or_else(|| format!("expected ID:FILE, got '{s}'"))?;
    Ok((parse_u16(id)?, file.to_string()))
}

fn open_image(fname: &str) -> anyhow::Result<(std::fs::File, OtaHeader)> {
    let mut f = std::fs::File::open(fname)
        .with_context(|| format!("Can't open OTA image {fname}"))?;
    let h = read_header(&mut f)
        .with_context(|| format!("Can't parse OTA header of {fname}"))?;
    Ok((f, h))
}

fn print_header(h: &OtaHeader) {
    println!("Header:");
    println!("  Header version:  0x{:04x}", h.header_version);
    println!("  Header length:   {}", h.header_length);
    println!(
        "  Field control:   [0x{:x}] {}",
        h.field_control().as_u16(),
        comma_separated(h.field_control())
    );
    println!("  Manufacturer:    0x{:04x}", h.manufacturer_id);
    println!("  Image type:      0x{:04x}", h.image_type);
    println!("  Version:         0x{:08x}", h.firmware_version);
    println!("  Stack version:   0x{:04x}", h.stack_version);
    println!("  Header string:   \"{}\"", h.header_str().escape_default());
    println!("  Image size:      {}", h.image_size);
    if let Some(c) = h.security_credentials {
        println!("  Credentials:     0x{c:02x}");
    }
    if let Some(d) = h.upgrade_destination {
        println!("  Destination:     {d}");
    }
    if let Some((min, max)) = h.hardware_versions {
        println!("  Hardware:        0x{min:04x} - 0x{max:04x}");
    }
}

fn print_tags(tags: &Tags, h: &OtaHeader) {
    println!("Tags:{}", if tags.is_empty() { " none" } else { "" });
    let mut offset = h.header_length as u32;
    for (idx, t) in tags.iter().enumerate() {
        println!(
            "   {:2}: id 0x{:04x} offset 0x{:06x} length {:8}  {}",
            idx,
            t.id,
            offset + TAG_OVERHEAD,
            t.length,
            tag_name(t.id)
        );
        offset += TAG_OVERHEAD + t.length;
    }
}

fn read_tags(f: &mut std::fs::File, h: &OtaHeader) -> anyhow::Result<Tags> {
    enumerate_tags(f, h).context("Bad tag table")
}

fn extract_tag(fname: &str, id: u16) -> anyhow::Result<()> {
    let (mut f, h) = open_image(fname)?;
    let (offset, len) = match tag_offset_and_size(&mut f, &h, id) {
        Ok(r) => r,
        Err(zigbee_ota::OtaError::NotFound) => {
            bail!("no tag 0x{id:04x} in {fname}")
        }
        Err(e) => return Err(e).context("Bad tag table"),
    };

    let out = format!("tag-{id:04x}.bin");
    println!("extracting tag 0x{id:04x} ({len} bytes) to {out}");
    let mut buf = vec![0u8; len as usize];
    f.read_exact_at(offset, &mut buf)?;

    let mut o = std::fs::File::create(&out)
        .with_context(|| format!("Can't open output file {out}"))?;
    o.write_all(&buf)?;
    Ok(())
}

fn create_image(c: CreateCommand) -> anyhow::Result<()> {
    let hw = match (c.hw_min, c.hw_max) {
        (None, None) => None,
        (Some(min), Some(max)) if min <= max => Some((min, max)),
        (Some(_), Some(_)) => bail!("hw-min exceeds hw-max"),
        _ => bail!("hw-min and hw-max must be given together"),
    };

    let id = ImageId::new(c.manufacturer, c.image_type, c.firmware_version);
    let mut h = OtaHeader::new(&id, &c.string);
    if c.string.len() > h.header_string.len() {
        warn!("header string truncated to {} bytes", h.header_string.len());
    }
    h.set_optional(c.security_credentials, c.destination, hw);

    let payload = std::fs::read(&c.payload)
        .with_context(|| format!("Can't read payload {}", c.payload))?;
    let mut contents = vec![(TAG_UPGRADE_IMAGE, payload)];
    for (tid, file) in c.tag {
        let d = std::fs::read(&file)
            .with_context(|| format!("Can't read tag file {file}"))?;
        contents.push((tid, d));
    }
    let tags: Vec<(u16, &[u8])> =
        contents.iter().map(|(i, d)| (*i, d.as_slice())).collect();

    let img = build_image(&mut h, &tags).context("Can't build image")?;
    std::fs::write(&c.output, &img)
        .with_context(|| format!("Can't write {}", c.output))?;
    info!("wrote {} bytes", img.len());
    println!("created {} for {}", c.output, h);
    Ok(())
}

#[derive(FromArgs, Debug)]
#[argh(description = "Zigbee OTA image utility")]
struct Args {
    /// debug logging
    #[argh(switch, short = 'd')]
    debug: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Info(InfoCommand),
    Tags(TagsCommand),
    Extract(ExtractCommand),
    Create(CreateCommand),
    Version(VersionCommand),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "info", description = "Show image header and tags")]
struct InfoCommand {
    #[argh(positional)]
    file: String,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "tags", description = "List image tags")]
struct TagsCommand {
    #[argh(positional)]
    file: String,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "extract", description = "Extract tag contents")]
struct ExtractCommand {
    #[argh(positional)]
    file: String,

    /// tag ids to extract
    #[argh(positional, from_str_fn(parse_u16))]
    tags: Vec<u16>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "create", description = "Create an OTA image")]
struct CreateCommand {
    /// output file
    #[argh(positional)]
    output: String,

    /// upgrade image payload
    #[argh(positional)]
    payload: String,

    /// manufacturer code
    #[argh(option, short = 'm', from_str_fn(parse_u16))]
    manufacturer: u16,

    /// image type
    #[argh(option, short = 't', from_str_fn(parse_u16))]
    image_type: u16,

    /// firmware version
    #[argh(option, short = 'v', from_str_fn(parse_u32))]
    firmware_version: u32,

    /// header string
    #[argh(option, short = 's', default = "String::new()")]
    string: String,

    /// minimum hardware version
    #[argh(option, from_str_fn(parse_u16))]
    hw_min: Option<u16>,

    /// maximum hardware version
    #[argh(option, from_str_fn(parse_u16))]
    hw_max: Option<u16>,

    /// destination device EUI64, most significant byte first
    #[argh(option, from_str_fn(parse_eui64))]
    destination: Option<Eui64>,

    /// security credential version
    #[argh(option)]
    security_credentials: Option<u8>,

    /// additional tag, as ID:FILE
    #[argh(option, from_str_fn(parse_tag_arg))]
    tag: Vec<(u16, String)>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "version", description = "Print ota-image version")]
struct VersionCommand {}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();

    let level = if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new().filter_level(level).init();

    match args.command {
        Command::Info(i) => {
            let (mut f, h) = open_image(&i.file)?;
            print_header(&h);
            let len = f.metadata()?.len();
            if len != h.image_size as u64 {
                println!(
                    "  Note: file length {len} differs from image size"
                );
            }
            match read_tags(&mut f, &h) {
                Ok(tags) => print_tags(&tags, &h),
                Err(e) => println!("Tags: {e:#}"),
            }
        }
        Command::Tags(t) => {
            let (mut f, h) = open_image(&t.file)?;
            let tags = read_tags(&mut f, &h)?;
            print_tags(&tags, &h);
        }
        Command::Extract(e) => {
            if e.tags.is_empty() {
                println!("No tags specified to extract");
            }
            for id in e.tags {
                if let Err(err) = extract_tag(&e.file, id) {
                    println!("Error extracting: {err:#}");
                }
            }
        }
        Command::Create(c) => create_image(c)?,
        Command::Version(_) => {
            println!("ota-image version {}", env!("VERSION"));
        }
    }

    Ok(())
}
