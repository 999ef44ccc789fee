//! # Paging engine
//!
//! Per-page operations on an [`AddressSpace`]: lazily creating page tables,
//! installing and clearing entries, translating addresses, loading CR3 and
//! turning paging on.

use crate::info::bootstrap_virtual_to_physical;
use crate::page_table::split_indices;
use crate::{
    AddressSpace, DirectoryIndex, FrameAlloc, Mmu, PageDirectory, PageFlags, PageTable, PdEntry,
    PtEntry, TableAlloc, TableRefs, VirtMapper,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use log::{debug, info};

/// Whether the MMU translates addresses yet. Only ever moves forward.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PagingMode {
    Disabled,
    Enabled,
}

/// Result of [`Paging::allocate_page`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapOutcome {
    /// A new entry was written for this frame.
    Mapped(PhysicalPage<Size4K>),
    /// The page already had a present entry; nothing changed.
    AlreadyMapped,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PagingError {
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("out of memory for page tables")]
    OutOfTableMemory,
    #[error("page table at {0} has no physical address")]
    UntranslatableTable(VirtualAddress),
    #[error("page directory at {0} has no physical address")]
    UntranslatableDirectory(VirtualAddress),
    #[error("no page directory loaded")]
    NoActiveDirectory,
    #[error("paging is already enabled")]
    AlreadyEnabled,
}

/// Paging state of the (single) CPU.
///
/// All table memory is reached through `M`, all privileged operations go
/// through `U`. The active address space changes only in
/// [`switch_page_directory`](Self::switch_page_directory).
pub struct Paging<M: VirtMapper, U: Mmu> {
    mapper: M,
    mmu: U,
    mode: PagingMode,
    active: Option<AddressSpace>,
}

impl<M: VirtMapper, U: Mmu> Paging<M, U> {
    pub const fn new(mapper: M, mmu: U) -> Self {
        Self {
            mapper,
            mmu,
            mode: PagingMode::Disabled,
            active: None,
        }
    }

    #[inline]
    pub const fn mode(&self) -> PagingMode {
        self.mode
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.mode == PagingMode::Enabled
    }

    /// The address space whose directory is in CR3.
    #[inline]
    pub const fn active(&self) -> Option<AddressSpace> {
        self.active
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Allocate an empty directory and its table shadow.
    ///
    /// # Errors
    /// [`PagingError::OutOfTableMemory`] when `tables` is exhausted.
    pub fn create_address_space<T: TableAlloc>(
        &self,
        tables: &mut T,
    ) -> Result<AddressSpace, PagingError> {
        let directory = tables.alloc_table().ok_or(PagingError::OutOfTableMemory)?;
        let refs = tables.alloc_table().ok_or(PagingError::OutOfTableMemory)?;
        let space = AddressSpace::new(directory, refs);
        debug!("created {space:?}");
        Ok(space)
    }

    /// Map `page` in `space`.
    ///
    /// The page table is created on demand. With `frame == None` a fresh
    /// frame comes from `frames`; otherwise the given frame is reserved there
    /// and used.
    ///
    /// # Errors
    /// - [`PagingError::OutOfTableMemory`] when a table was needed and `tables` is exhausted.
    /// - [`PagingError::UntranslatableTable`] when a new table has no physical address.
    /// - [`PagingError::OutOfFrames`] when `frames` is exhausted.
    pub fn allocate_page<F: FrameAlloc, T: TableAlloc>(
        &self,
        space: AddressSpace,
        page: VirtualPage<Size4K>,
        frame: Option<PhysicalPage<Size4K>>,
        flags: PageFlags,
        frames: &mut F,
        tables: &mut T,
    ) -> Result<MapOutcome, PagingError> {
        let (di, ti) = split_indices(page.base());
        let table = self.ensure_table(space, di, !flags.kernel, tables)?;
        let table = unsafe { self.table_mut(table) };

        if table.get(ti).present() {
            return Ok(MapOutcome::AlreadyMapped);
        }

        let frame = match frame {
            Some(frame) => {
                frames.reserve_frame(frame);
                frame
            }
            None => frames.alloc_frame().ok_or(PagingError::OutOfFrames)?,
        };

        table.set(ti, PtEntry::page(frame, flags));
        self.invalidate(space, page);
        Ok(MapOutcome::Mapped(frame))
    }

    /// Clear the entry for `page` and hand back the frame it mapped.
    ///
    /// The frame itself is not released.
    pub fn free_page(
        &self,
        space: AddressSpace,
        page: VirtualPage<Size4K>,
    ) -> Option<PhysicalPage<Size4K>> {
        let (di, ti) = split_indices(page.base());
        let table = unsafe { self.table_mut(self.table_of(space, di)?) };
        let entry = table.get(ti);
        if !entry.present() {
            return None;
        }
        table.set(ti, PtEntry::new());
        self.invalidate(space, page);
        Some(entry.frame())
    }

    /// Physical address behind `va` in `space`.
    ///
    /// Before paging is enabled this is the bootstrap rule, regardless of
    /// what `space` maps.
    pub fn virtual_to_physical(
        &self,
        space: AddressSpace,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        match self.mode {
            PagingMode::Disabled => Some(bootstrap_virtual_to_physical(va)),
            PagingMode::Enabled => self.walk(space, va),
        }
    }

    /// Whether `space` holds a present entry for `va`.
    pub fn is_mapped(&self, space: AddressSpace, va: VirtualAddress) -> bool {
        self.walk(space, va).is_some()
    }

    /// Present entry for `page`, if any.
    pub fn entry(&self, space: AddressSpace, page: VirtualPage<Size4K>) -> Option<PtEntry> {
        let (di, ti) = split_indices(page.base());
        let table = unsafe { self.table_ref(self.table_of(space, di)?) };
        Some(table.get(ti)).filter(|e| e.present())
    }

    /// Virtual page of the table in slot `di`, if present.
    pub fn table_of(&self, space: AddressSpace, di: DirectoryIndex) -> Option<VirtualPage<Size4K>> {
        unsafe { self.refs(space) }.get(di)
    }

    /// Make slot `di` of `dst` reference the same table as in `src`.
    ///
    /// Any table already referenced by `dst` in that slot is forgotten.
    pub fn share_table(&self, dst: AddressSpace, src: AddressSpace, di: DirectoryIndex) {
        let (entry, table) = unsafe { (self.directory(src).get(di), self.refs(src).get(di)) };
        unsafe {
            self.directory(dst).set(di, entry);
            self.refs(dst).set(di, table);
        }
    }

    /// Install `table` in slot `di` of `space`.
    ///
    /// # Errors
    /// [`PagingError::UntranslatableTable`] if the table has no physical address.
    pub fn install_table(
        &self,
        space: AddressSpace,
        di: DirectoryIndex,
        table: VirtualPage<Size4K>,
        user: bool,
    ) -> Result<(), PagingError> {
        let pa = self
            .physical_of(table.base())
            .ok_or(PagingError::UntranslatableTable(table.base()))?;
        unsafe {
            self.directory(space)
                .set(di, PdEntry::table(pa.page(), user));
            self.refs(space).set(di, Some(table));
        }
        debug!("page table {} installed at slot {}", table.base(), di.as_usize());
        Ok(())
    }

    /// Load the directory of `space` into CR3 and make it the active one.
    ///
    /// # Errors
    /// [`PagingError::UntranslatableDirectory`] if the directory has no physical address.
    pub fn switch_page_directory(&mut self, space: AddressSpace) -> Result<(), PagingError> {
        let va = space.directory().base();
        let pa = self
            .physical_of(va)
            .ok_or(PagingError::UntranslatableDirectory(va))?;
        unsafe { self.mmu.load_directory(pa.page()) };
        self.active = Some(space);
        debug!("switched to {space:?} ({pa})");
        Ok(())
    }

    /// Turn on paging.
    ///
    /// # Errors
    /// - [`PagingError::AlreadyEnabled`] on a second call.
    /// - [`PagingError::NoActiveDirectory`] if no directory was loaded.
    pub fn enable(&mut self) -> Result<(), PagingError> {
        if self.is_enabled() {
            return Err(PagingError::AlreadyEnabled);
        }
        if self.active.is_none() {
            return Err(PagingError::NoActiveDirectory);
        }
        unsafe { self.mmu.enable_paging() };
        self.mode = PagingMode::Enabled;
        info!("paging enabled");
        Ok(())
    }

    /// Page table for slot `di`, created and installed when missing.
    fn ensure_table<T: TableAlloc>(
        &self,
        space: AddressSpace,
        di: DirectoryIndex,
        user: bool,
        tables: &mut T,
    ) -> Result<VirtualPage<Size4K>, PagingError> {
        if let Some(table) = self.table_of(space, di) {
            let directory = unsafe { self.directory(space) };
            let entry = directory.get(di);
            if user && !entry.user() {
                directory.set(di, entry.with_user(true));
            }
            return Ok(table);
        }

        let table = tables.alloc_table().ok_or(PagingError::OutOfTableMemory)?;
        self.install_table(space, di, table, user)?;
        Ok(table)
    }

    /// Walk `space` through its table shadow.
    fn walk(&self, space: AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (page, offset) = va.split::<Size4K>();
        let entry = self.entry(space, page)?;
        Some(entry.frame().join(offset))
    }

    /// Physical address of a kernel structure under the current mode.
    fn physical_of(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match (self.mode, self.active) {
            (PagingMode::Disabled, _) => Some(bootstrap_virtual_to_physical(va)),
            (PagingMode::Enabled, Some(active)) => self.walk(active, va),
            (PagingMode::Enabled, None) => None,
        }
    }

    fn invalidate(&self, space: AddressSpace, page: VirtualPage<Size4K>) {
        if self.is_enabled() && self.active == Some(space) {
            unsafe { self.mmu.invalidate_page(page) };
        }
    }

    unsafe fn directory(&self, space: AddressSpace) -> &mut PageDirectory {
        unsafe { self.mapper.virt_to_mut(space.directory().base()) }
    }

    unsafe fn refs(&self, space: AddressSpace) -> &mut TableRefs {
        unsafe { self.mapper.virt_to_mut(space.tables().base()) }
    }

    unsafe fn table_mut(&self, table: VirtualPage<Size4K>) -> &mut PageTable {
        unsafe { self.mapper.virt_to_mut(table.base()) }
    }

    unsafe fn table_ref(&self, table: VirtualPage<Size4K>) -> &PageTable {
        unsafe { self.mapper.virt_to_mut(table.base()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::EmulatedMachine;
    use alloc::vec::Vec;

    /// Hands out consecutive frames and records what happens to them.
    struct BumpFrames {
        next: u32,
        end: u32,
        reserved: Vec<u32>,
        freed: Vec<u32>,
    }

    impl BumpFrames {
        fn new(start: u32, end: u32) -> Self {
            Self {
                next: start,
                end,
                reserved: Vec::new(),
                freed: Vec::new(),
            }
        }
    }

    impl FrameAlloc for BumpFrames {
        fn alloc_frame(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next >= self.end {
                return None;
            }
            let frame = PhysicalAddress::new(self.next).page();
            self.next += 4096;
            Some(frame)
        }

        fn reserve_frame(&mut self, frame: PhysicalPage<Size4K>) {
            self.reserved.push(frame.index());
        }

        fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
            self.freed.push(frame.index());
        }
    }

    /// Page-table memory carved from a higher-half window of the emulated RAM.
    struct BumpTables {
        next: u32,
        end: u32,
    }

    impl TableAlloc for BumpTables {
        fn alloc_table(&mut self) -> Option<VirtualPage<Size4K>> {
            if self.next >= self.end {
                return None;
            }
            let page = VirtualAddress::new(self.next).page();
            self.next += 4096;
            Some(page)
        }
    }

    // 4 MiB of RAM: tables at 1 MiB, frames from 2 MiB.
    const TABLES_VA: u32 = 0xC010_0000;
    const TABLES_END: u32 = 0xC014_0000;
    const FRAMES_PA: u32 = 0x0020_0000;

    fn setup() -> (&'static EmulatedMachine, BumpFrames, BumpTables) {
        let machine = EmulatedMachine::new(4 * 1024 * 1024).leak();
        (
            machine,
            BumpFrames::new(FRAMES_PA, 0x0040_0000),
            BumpTables {
                next: TABLES_VA,
                end: TABLES_END,
            },
        )
    }

    fn kernel_page(va: u32) -> VirtualPage<Size4K> {
        VirtualAddress::new(va).page()
    }

    #[test]
    fn allocate_creates_table_and_entry() {
        let (machine, mut frames, mut tables) = setup();
        let paging = Paging::new(machine, machine);
        let space = paging.create_address_space(&mut tables).unwrap();

        let page = kernel_page(0xD000_0000);
        let outcome = paging
            .allocate_page(space, page, None, PageFlags::KERNEL_RW, &mut frames, &mut tables)
            .unwrap();
        assert_eq!(
            outcome,
            MapOutcome::Mapped(PhysicalAddress::new(FRAMES_PA).page())
        );

        let di = DirectoryIndex::from(page.base());
        let table = paging.table_of(space, di).expect("table created");
        assert_eq!(table.base(), VirtualAddress::new(TABLES_VA + 0x2000));

        // The hardware entry points at the table's physical frame.
        let pde = machine
            .read_phys_u32(bootstrap_virtual_to_physical(space.directory().base()) + 4 * 0x340);
        assert_eq!(pde & !0xFFF, 0x0010_2000);
        assert_eq!(pde & 0b111, 0b011);

        assert!(paging.is_mapped(space, page.base()));
        let entry = paging.entry(space, page).unwrap();
        assert_eq!(PageFlags::from_entry(entry), PageFlags::KERNEL_RW);
    }

    #[test]
    fn second_allocate_reports_already_mapped() {
        let (machine, mut frames, mut tables) = setup();
        let paging = Paging::new(machine, machine);
        let space = paging.create_address_space(&mut tables).unwrap();
        let page = kernel_page(0xD000_1000);

        paging
            .allocate_page(space, page, None, PageFlags::KERNEL_RW, &mut frames, &mut tables)
            .unwrap();
        let before = frames.next;
        let again = paging
            .allocate_page(space, page, None, PageFlags::KERNEL_RW, &mut frames, &mut tables)
            .unwrap();
        assert_eq!(again, MapOutcome::AlreadyMapped);
        assert_eq!(frames.next, before);
    }

    #[test]
    fn explicit_frame_is_reserved_and_user_bit_propagates() {
        let (machine, mut frames, mut tables) = setup();
        let paging = Paging::new(machine, machine);
        let space = paging.create_address_space(&mut tables).unwrap();

        let frame = PhysicalAddress::new(0x0030_0000).page();
        let page = VirtualAddress::new(0x0040_0000).page();
        paging
            .allocate_page(space, page, Some(frame), PageFlags::USER_RW, &mut frames, &mut tables)
            .unwrap();
        assert_eq!(frames.reserved, [frame.index()]);

        let entry = paging.entry(space, page).unwrap();
        assert!(entry.user());
        assert_eq!(entry.frame(), frame);
    }

    #[test]
    fn free_page_returns_frame_without_freeing() {
        let (machine, mut frames, mut tables) = setup();
        let paging = Paging::new(machine, machine);
        let space = paging.create_address_space(&mut tables).unwrap();
        let page = kernel_page(0xD000_2000);

        let MapOutcome::Mapped(frame) = paging
            .allocate_page(space, page, None, PageFlags::KERNEL_RW, &mut frames, &mut tables)
            .unwrap()
        else {
            panic!("expected a fresh mapping");
        };

        assert_eq!(paging.free_page(space, page), Some(frame));
        assert!(frames.freed.is_empty());
        assert!(!paging.is_mapped(space, page.base()));
        assert_eq!(paging.free_page(space, page), None);
    }

    #[test]
    fn translation_follows_mode() {
        let (machine, mut frames, mut tables) = setup();
        let mut paging = Paging::new(machine, machine);
        let space = paging.create_address_space(&mut tables).unwrap();

        // Disabled: bootstrap rule, whatever the space maps.
        let va = VirtualAddress::new(0xC012_3456);
        assert_eq!(
            paging.virtual_to_physical(space, va),
            Some(PhysicalAddress::new(0x0012_3456))
        );
        assert_eq!(
            paging.virtual_to_physical(space, VirtualAddress::new(0x1234)),
            Some(PhysicalAddress::new(0x1234))
        );

        // Map the table window onto itself so the tables stay reachable.
        for va in (TABLES_VA..TABLES_END).step_by(4096) {
            let frame = bootstrap_virtual_to_physical(VirtualAddress::new(va)).page();
            paging
                .allocate_page(space, kernel_page(va), Some(frame), PageFlags::KERNEL_RW, &mut frames, &mut tables)
                .unwrap();
        }
        let data = kernel_page(0xD000_0000);
        let MapOutcome::Mapped(frame) = paging
            .allocate_page(space, data, None, PageFlags::KERNEL_RW, &mut frames, &mut tables)
            .unwrap()
        else {
            panic!("expected a fresh mapping");
        };

        assert_eq!(paging.enable(), Err(PagingError::NoActiveDirectory));
        paging.switch_page_directory(space).unwrap();
        assert_eq!(
            machine.directory(),
            Some(bootstrap_virtual_to_physical(space.directory().base()).page())
        );
        paging.enable().unwrap();
        assert!(machine.paging_enabled());
        assert_eq!(paging.enable(), Err(PagingError::AlreadyEnabled));

        let va = data.base() + 0x10;
        assert_eq!(paging.virtual_to_physical(space, va), Some(frame.base() + 0x10));
        assert_eq!(machine.try_translate(va), Some(frame.base() + 0x10));
        assert_eq!(
            paging.virtual_to_physical(space, VirtualAddress::new(0xD040_0000)),
            None
        );

        // Writes through the mapper land in the mapped frame.
        unsafe { *paging.mapper().virt_to_mut::<u32>(va) = 0xDEAD_BEEF };
        assert_eq!(machine.read_phys_u32(frame.base() + 0x10), 0xDEAD_BEEF);

        // Changes to the active space invalidate the TLB entry.
        let before = machine.invalidations();
        paging.free_page(space, data);
        assert_eq!(machine.invalidations(), before + 1);
    }

    #[test]
    fn share_table_aliases_the_slot() {
        let (machine, mut frames, mut tables) = setup();
        let paging = Paging::new(machine, machine);
        let a = paging.create_address_space(&mut tables).unwrap();
        let b = paging.create_address_space(&mut tables).unwrap();
        let page = kernel_page(0xE000_0000);
        let di = DirectoryIndex::from(page.base());

        paging
            .allocate_page(a, page, None, PageFlags::KERNEL_RW, &mut frames, &mut tables)
            .unwrap();
        paging.share_table(b, a, di);
        assert_eq!(paging.table_of(b, di), paging.table_of(a, di));

        // A page added through one space is visible in the other.
        let next = kernel_page(0xE000_1000);
        paging
            .allocate_page(a, next, None, PageFlags::KERNEL_RW, &mut frames, &mut tables)
            .unwrap();
        assert!(paging.is_mapped(b, next.base()));
    }

    #[test]
    fn table_exhaustion_is_reported() {
        let machine = EmulatedMachine::new(4 * 1024 * 1024).leak();
        let paging = Paging::new(machine, machine);
        let mut frames = BumpFrames::new(FRAMES_PA, 0x0040_0000);
        let mut tables = BumpTables {
            next: TABLES_VA,
            end: TABLES_VA + 0x2000,
        };
        let space = paging.create_address_space(&mut tables).unwrap();
        let err = paging
            .allocate_page(space, kernel_page(0xD000_0000), None, PageFlags::KERNEL_RW, &mut frames, &mut tables)
            .unwrap_err();
        assert_eq!(err, PagingError::OutOfTableMemory);
    }
}
