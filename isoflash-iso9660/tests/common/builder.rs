//! Minimal synthetic ISO 9660 image builder for tests.
//!
//! Lays out a primary volume descriptor at sector 16, a terminator at 17,
//! then one sector per directory followed by the file data. Every
//! directory's records must fit in a single 2048-byte sector, which is
//! plenty for test trees.

use std::io::Write as _;

use tempfile::NamedTempFile;

const SECTOR: usize = 2048;

#[derive(Default)]
pub struct DirSpec {
    dirs: Vec<(String, DirSpec)>,
    files: Vec<(String, Vec<u8>)>,
}

impl DirSpec {
    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        self.files.push((name.to_owned(), content.to_vec()));
        self
    }

    pub fn dir(mut self, name: &str, spec: DirSpec) -> Self {
        self.dirs.push((name.to_owned(), spec));
        self
    }

    fn count_dirs(&self) -> usize {
        1 + self.dirs.iter().map(|(_, d)| d.count_dirs()).sum::<usize>()
    }

    fn count_file_sectors(&self) -> usize {
        self.files
            .iter()
            .map(|(_, c)| c.len().div_ceil(SECTOR).max(1))
            .sum::<usize>()
            + self
                .dirs
                .iter()
                .map(|(_, d)| d.count_file_sectors())
                .sum::<usize>()
    }
}

pub struct IsoBuilder {
    label: String,
    el_torito: bool,
    boot_sector_magic: bool,
    root: DirSpec,
}

impl IsoBuilder {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            el_torito: false,
            boot_sector_magic: false,
            root: DirSpec::default(),
        }
    }

    pub fn el_torito(mut self) -> Self {
        self.el_torito = true;
        self
    }

    pub fn boot_sector_magic(mut self) -> Self {
        self.boot_sector_magic = true;
        self
    }

    pub fn root(mut self, spec: DirSpec) -> Self {
        self.root = spec;
        self
    }

    pub fn build(self) -> NamedTempFile {
        let root_lba = 18_u32;
        let dir_sectors = self.root.count_dirs();
        let file_sectors = self.root.count_file_sectors();
        let total_sectors = 18 + dir_sectors + file_sectors;

        let mut data = vec![0_u8; total_sectors * SECTOR];

        // Primary volume descriptor.
        let pvd = 16 * SECTOR;
        data[pvd] = 1;
        data[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
        data[pvd + 6] = 1;
        let mut label = self.label.as_bytes().to_vec();
        label.resize(32, b' ');
        data[pvd + 40..pvd + 72].copy_from_slice(&label);
        data[pvd + 158..pvd + 162].copy_from_slice(&root_lba.to_le_bytes());
        data[pvd + 166..pvd + 170].copy_from_slice(&2048_u32.to_le_bytes());
        data[pvd + 813..pvd + 829].copy_from_slice(b"2024010112000000");

        // Volume descriptor set terminator, with optional El Torito
        // evidence in the same sector for the bootable variants.
        let term = 17 * SECTOR;
        data[term] = 255;
        data[term + 1..term + 6].copy_from_slice(b"CD001");
        data[term + 6] = 1;
        if self.el_torito {
            data[term + 7..term + 30].copy_from_slice(b"EL TORITO SPECIFICATION");
        }

        if self.boot_sector_magic {
            // 0x8000 + 510 lands inside the PVD's free system-use area.
            data[0x8000 + 510] = 0x55;
            data[0x8000 + 511] = 0xaa;
        }

        let mut next_file_lba = root_lba + u32::try_from(dir_sectors).unwrap();
        Self::write_dir(&mut data, &self.root, root_lba, root_lba, &mut next_file_lba);

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn write_dir(
        data: &mut [u8],
        spec: &DirSpec,
        lba: u32,
        parent_lba: u32,
        next_file_lba: &mut u32,
    ) {
        let mut offset = lba as usize * SECTOR;
        write_record(data, &mut offset, lba, 2048, 0x02, b"\x00");
        write_record(data, &mut offset, parent_lba, 2048, 0x02, b"\x01");

        for (name, content) in &spec.files {
            let file_lba = *next_file_lba;
            *next_file_lba += u32::try_from(content.len().div_ceil(SECTOR).max(1)).unwrap();

            write_record(
                data,
                &mut offset,
                file_lba,
                u32::try_from(content.len()).unwrap(),
                0x00,
                name.as_bytes(),
            );

            let file_offset = file_lba as usize * SECTOR;
            data[file_offset..file_offset + content.len()].copy_from_slice(content);
        }

        // Directory sectors are laid out in preorder: a child's extent
        // comes right after its left siblings' whole subtrees.
        let mut child_lba = lba + 1;
        let mut child_lbas = Vec::new();
        for (name, child) in &spec.dirs {
            child_lbas.push(child_lba);
            write_record(data, &mut offset, child_lba, 2048, 0x02, name.as_bytes());
            child_lba += u32::try_from(child.count_dirs()).unwrap();
        }

        for ((_, child), child_lba) in spec.dirs.iter().zip(child_lbas) {
            Self::write_dir(data, child, child_lba, lba, next_file_lba);
        }
    }
}

fn write_record(data: &mut [u8], offset: &mut usize, lba: u32, size: u32, flags: u8, name: &[u8]) {
    let mut len = 33 + name.len();
    if len % 2 != 0 {
        len += 1;
    }

    let rec = &mut data[*offset..*offset + len];
    rec[0] = u8::try_from(len).unwrap();
    rec[2..6].copy_from_slice(&lba.to_le_bytes());
    rec[10..14].copy_from_slice(&size.to_le_bytes());
    rec[25] = flags;
    rec[32] = u8::try_from(name.len()).unwrap();
    rec[33..33 + name.len()].copy_from_slice(name);

    *offset += len;
}
