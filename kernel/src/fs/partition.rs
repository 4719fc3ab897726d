//! Partition-table scanning: GPT with CRC validation, MBR fallback, raw
//! drive when neither matches.

use core::sync::atomic::Ordering;

use alloc::{sync::Arc, vec, vec::Vec};

use crate::error::{KernelError, KernelResult};

use super::vnode::{FilePerm, PartitionInfo, Vnode, VnodeFlags, VnodeKind};

/// IEEE CRC-32 (polynomial 0xEDB88320), reflected, as GPT requires.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// What the scan concluded about the drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Gpt,
    Mbr,
    Raw,
}

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const MBR_BOOT_SIG: u16 = 0xAA55;

fn read_block(vn: &Arc<Vnode>, lba: u64, blk: usize) -> KernelResult<Vec<u8>> {
    let (driver, desc, base) = vn.io_path()?;
    let mut buf = vec![0u8; blk];
    driver
        .ops
        .read_sync(desc, &mut buf, base / blk as u64 + lba, 1)?;
    Ok(buf)
}

fn parse_gpt(vn: &Arc<Vnode>, blk: usize) -> KernelResult<Option<Vec<PartitionInfo>>> {
    let header = read_block(vn, 1, blk)?;
    if &header[0..8] != GPT_SIGNATURE {
        return Ok(None);
    }
    let header_size = u32::from_le_bytes(header[12..16].try_into().unwrap_or_default()) as usize;
    if header_size < 92 || header_size > blk {
        return Ok(None);
    }
    let stored_crc = u32::from_le_bytes(header[16..20].try_into().unwrap_or_default());
    let mut check = header[..header_size].to_vec();
    check[16..20].fill(0);
    if crc32(&check) != stored_crc {
        log::warn!("partition: GPT header CRC mismatch, ignoring table");
        return Ok(None);
    }

    let entries_lba = u64::from_le_bytes(header[72..80].try_into().unwrap_or_default());
    let entry_count = u32::from_le_bytes(header[80..84].try_into().unwrap_or_default()) as usize;
    let entry_size = u32::from_le_bytes(header[84..88].try_into().unwrap_or_default()) as usize;
    let array_crc = u32::from_le_bytes(header[88..92].try_into().unwrap_or_default());
    if entry_size < 128 || entry_count == 0 || entry_count > 512 {
        return Ok(None);
    }

    let array_bytes = entry_count * entry_size;
    let array_blocks = array_bytes.div_ceil(blk);
    let mut array = Vec::with_capacity(array_blocks * blk);
    for i in 0..array_blocks {
        array.extend_from_slice(&read_block(vn, entries_lba + i as u64, blk)?);
    }
    array.truncate(array_bytes);
    if crc32(&array) != array_crc {
        log::warn!("partition: GPT entry-array CRC mismatch, ignoring table");
        return Ok(None);
    }

    let mut parts = Vec::new();
    for (i, entry) in array.chunks(entry_size).enumerate() {
        let type_uuid: [u8; 16] = entry[0..16].try_into().unwrap_or_default();
        if type_uuid == [0u8; 16] {
            continue;
        }
        let unique_uuid: [u8; 16] = entry[16..32].try_into().unwrap_or_default();
        let first = u64::from_le_bytes(entry[32..40].try_into().unwrap_or_default());
        let last = u64::from_le_bytes(entry[40..48].try_into().unwrap_or_default());
        if last < first {
            continue;
        }
        parts.push(PartitionInfo {
            off: first * blk as u64,
            len: (last - first + 1) * blk as u64,
            part_id: i as u32,
            type_uuid,
            unique_uuid,
        });
    }
    Ok(Some(parts))
}

fn parse_mbr(vn: &Arc<Vnode>, blk: usize) -> KernelResult<Option<Vec<PartitionInfo>>> {
    let sector = read_block(vn, 0, blk)?;
    if sector.len() < 512 {
        return Ok(None);
    }
    let sig = u16::from_le_bytes([sector[510], sector[511]]);
    if sig != MBR_BOOT_SIG {
        return Ok(None);
    }
    let mut parts = Vec::new();
    for i in 0..4 {
        let entry = &sector[446 + i * 16..446 + (i + 1) * 16];
        let kind = entry[4];
        if kind == 0 {
            continue;
        }
        let first = u32::from_le_bytes(entry[8..12].try_into().unwrap_or_default()) as u64;
        let count = u32::from_le_bytes(entry[12..16].try_into().unwrap_or_default()) as u64;
        if count == 0 {
            continue;
        }
        parts.push(PartitionInfo {
            off: first * blk as u64,
            len: count * blk as u64,
            part_id: i as u32,
            type_uuid: [0u8; 16],
            unique_uuid: [0u8; 16],
        });
    }
    Ok(Some(parts))
}

/// Scan a block device. Records the discovered partitions on the vnode
/// and returns the table kind plus partition vnodes overlaying the
/// parent device.
pub fn scan(vn: &Arc<Vnode>) -> KernelResult<(TableKind, Vec<Arc<Vnode>>)> {
    if vn.kind != VnodeKind::BlockDev {
        return Err(KernelError::InvalidFile);
    }
    let (driver, desc, _) = vn.io_path()?;
    let blk = driver.ops.get_blk_size(desc)?;

    let (kind, parts) = if let Some(parts) = parse_gpt(vn, blk)? {
        (TableKind::Gpt, parts)
    } else if let Some(parts) = parse_mbr(vn, blk)? {
        (TableKind::Mbr, parts)
    } else {
        (TableKind::Raw, Vec::new())
    };

    *vn.partitions.lock() = parts.clone();
    let mut vnodes = Vec::new();
    for part in parts {
        let pv = Vnode::new(VnodeKind::BlockDev, FilePerm::from_mode(0o600), 0, 0);
        *pv.driver.lock() = vn.driver.lock().clone();
        pv.desc.store(vn.desc.load(Ordering::Acquire), Ordering::Release);
        pv.size.store(part.len, Ordering::Release);
        pv.flags.lock().insert(VnodeFlags::PARTITION);
        pv.partitions.lock().push(part);
        vnodes.push(pv);
    }
    Ok((kind, vnodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverOps;
    use crate::fs::blockdev::{ramdisk_vnode, RamDisk, RAMDISK_BLOCK};

    #[test]
    fn crc32_matches_the_ieee_vector() {
        // The canonical check value for "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    fn build_gpt_disk() -> RamDisk {
        let disk = RamDisk::new(64);
        // One entry: partition 0 at LBA 8..=15.
        let mut entry = [0u8; 128];
        entry[0] = 0xEE; // non-zero type uuid
        entry[16] = 0x01;
        entry[32..40].copy_from_slice(&8u64.to_le_bytes());
        entry[40..48].copy_from_slice(&15u64.to_le_bytes());
        let mut array = vec![0u8; 128 * 4];
        array[..128].copy_from_slice(&entry);
        let array_crc = crc32(&array);

        let mut header = vec![0u8; 92];
        header[0..8].copy_from_slice(GPT_SIGNATURE);
        header[12..16].copy_from_slice(&92u32.to_le_bytes());
        header[72..80].copy_from_slice(&2u64.to_le_bytes()); // entries at LBA 2
        header[80..84].copy_from_slice(&4u32.to_le_bytes()); // 4 entries
        header[84..88].copy_from_slice(&128u32.to_le_bytes());
        header[88..92].copy_from_slice(&array_crc.to_le_bytes());
        let header_crc = crc32(&header);
        header[16..20].copy_from_slice(&header_crc.to_le_bytes());

        let mut block = vec![0u8; RAMDISK_BLOCK];
        block[..92].copy_from_slice(&header);
        disk.write_sync(0, &block, 1, 1).unwrap();
        disk.write_sync(0, &array, 2, 1).unwrap();
        disk
    }

    #[test]
    fn valid_gpt_is_recognized() {
        let (_driver, vn) = ramdisk_vnode("gpt-ok-test", build_gpt_disk());
        let (kind, parts) = scan(&vn).unwrap();
        assert_eq!(kind, TableKind::Gpt);
        assert_eq!(parts.len(), 1);
        let info = parts[0].partitions.lock()[0];
        assert_eq!(info.off, 8 * RAMDISK_BLOCK as u64);
        assert_eq!(info.len, 8 * RAMDISK_BLOCK as u64);
        assert!(parts[0].flags.lock().contains(VnodeFlags::PARTITION));
    }

    #[test]
    fn corrupt_gpt_falls_back() {
        let disk = build_gpt_disk();
        // Flip a byte inside the protected header area.
        let mut block = vec![0u8; RAMDISK_BLOCK];
        disk.read_sync(0, &mut block, 1, 1).unwrap();
        block[40] ^= 0xFF;
        disk.write_sync(0, &block, 1, 1).unwrap();
        let (_driver, vn) = ramdisk_vnode("gpt-bad-test", disk);
        let (kind, parts) = scan(&vn).unwrap();
        assert_eq!(kind, TableKind::Raw);
        assert!(parts.is_empty());
    }

    #[test]
    fn mbr_fallback_parses_entries() {
        let disk = RamDisk::new(32);
        let mut sector = vec![0u8; RAMDISK_BLOCK];
        sector[510] = 0x55;
        sector[511] = 0xAA;
        // Entry 0: type 0x83, start LBA 4, 12 sectors.
        sector[446 + 4] = 0x83;
        sector[446 + 8..446 + 12].copy_from_slice(&4u32.to_le_bytes());
        sector[446 + 12..446 + 16].copy_from_slice(&12u32.to_le_bytes());
        disk.write_sync(0, &sector, 0, 1).unwrap();
        let (_driver, vn) = ramdisk_vnode("mbr-test", disk);
        let (kind, parts) = scan(&vn).unwrap();
        assert_eq!(kind, TableKind::Mbr);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].partitions.lock()[0].off, 4 * RAMDISK_BLOCK as u64);
    }

    #[test]
    fn blank_disk_is_raw() {
        let (_driver, vn) = ramdisk_vnode("raw-test", RamDisk::new(8));
        let (kind, parts) = scan(&vn).unwrap();
        assert_eq!(kind, TableKind::Raw);
        assert!(parts.is_empty());
    }
}
