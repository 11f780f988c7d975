//! Built-in plant catalog and first-boot provisioning.
//!
//! The catalog is an immutable table compiled into the binary (FAO-56
//! reference crops). It is exposed as virtual pack 0 with plant ids
//! `1..=len`, and mirrored onto flash the first time the store comes up so
//! consumers can treat every plant the same way.

use std::borrow::Cow;

use tracing::{info, warn};

use super::record::{
    FixedStr, PackRecord, PlantListEntry, PlantRecord, PlantSource, BUILTIN_PACK_ID,
};
use super::store::{InstallOutcome, PackStore};
use crate::error::StoreError;

/// Name of virtual pack 0 in storage-level reads.
pub const BUILTIN_PACK_NAME: &str = "Built-in Database";

/// Records mirrored between cooperative yields during provisioning.
const PROVISION_YIELD_EVERY: usize = 20;

// ---------------------------------------------------------------------------
// ROM entries
// ---------------------------------------------------------------------------

/// One ROM row. Lengths are stored as metres ×1000, density as plants/m² ×100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub common_name: &'static str,
    pub scientific_name: &'static str,
    pub kc_x1000: [u16; 4],
    pub root_depth_m_x1000: [u16; 2],
    /// Initial, development, mid-season and late stage lengths in days.
    pub stage_days: [u16; 4],
    pub growth_cycle: u8,
    pub depletion_fraction_p_x1000: u16,
    /// Row and in-row spacing.
    pub spacing_m_x1000: [u16; 2],
    pub density_x100: u16,
    pub canopy_max_x1000: u16,
    pub frost_tolerance_c: i8,
    pub temp_opt_c: [u8; 2],
    pub typ_irrig_method_id: u8,
}

const ANNUAL: u8 = 0;
const PERENNIAL: u8 = 1;

// Irrigation method ids
const SURFACE: u8 = 0;
const DRIP: u8 = 1;
const SPRINKLER: u8 = 2;
const MICRO_SPRAY: u8 = 3;

#[allow(clippy::too_many_arguments)]
const fn crop(
    common_name: &'static str,
    scientific_name: &'static str,
    kc_x1000: [u16; 4],
    root_depth_m_x1000: [u16; 2],
    stage_days: [u16; 4],
    growth_cycle: u8,
    depletion_fraction_p_x1000: u16,
    spacing_m_x1000: [u16; 2],
    density_x100: u16,
    canopy_max_x1000: u16,
    frost_tolerance_c: i8,
    temp_opt_c: [u8; 2],
    typ_irrig_method_id: u8,
) -> CatalogEntry {
    CatalogEntry {
        common_name,
        scientific_name,
        kc_x1000,
        root_depth_m_x1000,
        stage_days,
        growth_cycle,
        depletion_fraction_p_x1000,
        spacing_m_x1000,
        density_x100,
        canopy_max_x1000,
        frost_tolerance_c,
        temp_opt_c,
        typ_irrig_method_id,
    }
}

#[rustfmt::skip]
static BUILTIN_PLANTS: [CatalogEntry; 30] = [
    crop("Tomato", "Solanum lycopersicum", [600, 900, 1150, 800], [700, 1500], [30, 40, 40, 25], ANNUAL, 400, [1000, 500], 200, 800, 2, [18, 27], DRIP),
    crop("Sweet pepper", "Capsicum annuum", [600, 850, 1050, 900], [500, 1000], [30, 35, 40, 20], ANNUAL, 300, [700, 400], 350, 700, 3, [20, 28], DRIP),
    crop("Eggplant", "Solanum melongena", [600, 850, 1050, 900], [700, 1200], [30, 40, 40, 20], ANNUAL, 450, [900, 600], 185, 800, 4, [22, 30], DRIP),
    crop("Cucumber", "Cucumis sativus", [600, 800, 1000, 750], [700, 1200], [20, 30, 40, 15], ANNUAL, 500, [1200, 400], 200, 850, 4, [20, 30], DRIP),
    crop("Zucchini", "Cucurbita pepo", [500, 700, 1000, 800], [600, 1000], [25, 35, 25, 15], ANNUAL, 500, [1200, 900], 90, 800, 4, [18, 28], DRIP),
    crop("Melon", "Cucumis melo", [500, 700, 850, 600], [800, 1500], [25, 35, 40, 20], ANNUAL, 400, [1500, 800], 80, 800, 5, [22, 32], DRIP),
    crop("Watermelon", "Citrullus lanatus", [400, 650, 1000, 750], [800, 1500], [20, 30, 30, 30], ANNUAL, 400, [2000, 1000], 50, 800, 5, [22, 32], DRIP),
    crop("Lettuce", "Lactuca sativa", [700, 850, 1000, 950], [300, 500], [20, 30, 15, 10], ANNUAL, 300, [300, 250], 1300, 700, -2, [12, 22], SPRINKLER),
    crop("Spinach", "Spinacia oleracea", [700, 850, 1000, 950], [300, 500], [20, 20, 15, 5], ANNUAL, 200, [300, 100], 3300, 700, -6, [10, 20], SPRINKLER),
    crop("Cabbage", "Brassica oleracea var. capitata", [700, 850, 1050, 950], [500, 800], [40, 60, 50, 15], ANNUAL, 450, [600, 450], 370, 800, -6, [15, 20], SPRINKLER),
    crop("Broccoli", "Brassica oleracea var. italica", [700, 850, 1050, 950], [400, 600], [35, 45, 40, 15], ANNUAL, 450, [600, 450], 370, 800, -4, [15, 22], SPRINKLER),
    crop("Cauliflower", "Brassica oleracea var. botrytis", [700, 850, 1050, 950], [400, 700], [35, 50, 40, 15], ANNUAL, 450, [600, 500], 330, 800, -2, [15, 22], SPRINKLER),
    crop("Carrot", "Daucus carota", [700, 850, 1050, 950], [500, 1000], [20, 30, 50, 20], ANNUAL, 350, [300, 50], 6600, 700, -3, [15, 22], SPRINKLER),
    crop("Onion", "Allium cepa", [700, 850, 1050, 750], [300, 600], [15, 25, 70, 40], ANNUAL, 300, [300, 100], 3300, 500, -5, [13, 24], SPRINKLER),
    crop("Garlic", "Allium sativum", [700, 850, 1000, 700], [300, 500], [20, 30, 70, 30], ANNUAL, 300, [300, 100], 3300, 500, -10, [12, 24], SPRINKLER),
    crop("Potato", "Solanum tuberosum", [500, 800, 1150, 750], [400, 600], [25, 30, 45, 30], ANNUAL, 350, [750, 300], 440, 800, -1, [15, 22], SPRINKLER),
    crop("Sweet corn", "Zea mays var. saccharata", [300, 700, 1150, 1050], [800, 1200], [20, 25, 25, 10], ANNUAL, 400, [750, 250], 530, 900, 0, [21, 30], SPRINKLER),
    crop("Green bean", "Phaseolus vulgaris", [500, 750, 1050, 900], [500, 700], [20, 30, 30, 10], ANNUAL, 450, [500, 100], 2000, 800, 2, [18, 27], DRIP),
    crop("Pea", "Pisum sativum", [500, 800, 1150, 1050], [600, 1000], [15, 25, 35, 15], ANNUAL, 350, [500, 50], 4000, 800, -2, [13, 22], SPRINKLER),
    crop("Strawberry", "Fragaria x ananassa", [400, 650, 850, 750], [200, 300], [20, 30, 60, 30], PERENNIAL, 200, [600, 300], 550, 700, -8, [15, 25], DRIP),
    crop("Grapevine", "Vitis vinifera", [300, 550, 700, 450], [1000, 2000], [30, 60, 40, 80], PERENNIAL, 350, [2500, 1500], 27, 600, -15, [20, 30], DRIP),
    crop("Apple", "Malus domestica", [600, 800, 950, 750], [1000, 2000], [30, 50, 130, 30], PERENNIAL, 500, [4000, 2000], 12, 700, -25, [15, 25], DRIP),
    crop("Orange", "Citrus sinensis", [700, 680, 650, 700], [1200, 1500], [60, 90, 120, 95], PERENNIAL, 500, [6000, 4000], 4, 700, -3, [23, 30], DRIP),
    crop("Olive", "Olea europaea", [650, 700, 700, 700], [1200, 1700], [30, 90, 60, 90], PERENNIAL, 650, [7000, 5000], 3, 500, -7, [15, 30], DRIP),
    crop("Basil", "Ocimum basilicum", [600, 800, 1050, 900], [200, 400], [15, 25, 40, 20], ANNUAL, 350, [400, 250], 1000, 600, 5, [20, 30], MICRO_SPRAY),
    crop("Lawn (cool season)", "Poa pratensis", [900, 950, 950, 950], [500, 1000], [10, 20, 300, 25], PERENNIAL, 400, [0, 0], 0, 1000, -20, [15, 24], SPRINKLER),
    crop("Lawn (warm season)", "Cynodon dactylon", [800, 850, 850, 850], [500, 1000], [10, 20, 300, 25], PERENNIAL, 500, [0, 0], 0, 1000, -5, [24, 35], SPRINKLER),
    crop("Rose", "Rosa spp.", [500, 700, 900, 700], [400, 800], [30, 40, 120, 60], PERENNIAL, 450, [1000, 800], 125, 700, -15, [15, 26], DRIP),
    crop("Lavender", "Lavandula angustifolia", [350, 450, 550, 450], [300, 600], [30, 40, 150, 60], PERENNIAL, 600, [1000, 600], 170, 600, -15, [15, 30], DRIP),
    crop("Rice (paddy)", "Oryza sativa", [1050, 1100, 1200, 900], [500, 1000], [30, 30, 60, 30], ANNUAL, 200, [200, 200], 2500, 900, 10, [25, 32], SURFACE),
];

impl CatalogEntry {
    /// Project onto a storable plant record with the default agronomy knobs.
    pub fn to_plant(&self, plant_id: u16) -> PlantRecord {
        PlantRecord {
            plant_id,
            pack_id: BUILTIN_PACK_ID,
            version: 1,
            common_name: FixedStr::new(self.common_name),
            scientific_name: FixedStr::new(self.scientific_name),
            kc_ini_x1000: self.kc_x1000[0],
            kc_dev_x1000: self.kc_x1000[1],
            kc_mid_x1000: self.kc_x1000[2],
            kc_end_x1000: self.kc_x1000[3],
            // m ×1000 is mm
            root_depth_min_mm: self.root_depth_m_x1000[0],
            root_depth_max_mm: self.root_depth_m_x1000[1],
            stage_days_ini: clamp_u8(self.stage_days[0]),
            stage_days_dev: clamp_u8(self.stage_days[1]),
            stage_days_mid: self.stage_days[2],
            stage_days_end: clamp_u8(self.stage_days[3]),
            growth_cycle: self.growth_cycle,
            depletion_fraction_p_x1000: self.depletion_fraction_p_x1000,
            spacing_row_mm: self.spacing_m_x1000[0],
            spacing_plant_mm: self.spacing_m_x1000[1],
            density_x100: self.density_x100,
            canopy_max_x1000: self.canopy_max_x1000,
            frost_tolerance_c: self.frost_tolerance_c,
            temp_opt_min_c: self.temp_opt_c[0],
            temp_opt_max_c: self.temp_opt_c[1],
            typ_irrig_method_id: self.typ_irrig_method_id,
            water_need_factor_x100: 100,
            irrigation_freq_days: 3,
            prefer_area_based: true,
        }
    }
}

fn clamp_u8(v: u16) -> u8 {
    v.min(u16::from(u8::MAX)) as u8
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// The read-only built-in table, addressed by 1-based plant id.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Cow<'static, [CatalogEntry]>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    pub fn builtin() -> Self {
        Self {
            entries: Cow::Borrowed(&BUILTIN_PLANTS),
        }
    }

    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        Self {
            entries: Cow::Owned(entries),
        }
    }

    /// The first `n` built-in entries.
    pub fn take(n: usize) -> Self {
        Self::from_entries(BUILTIN_PLANTS.iter().take(n).copied().collect())
    }

    pub fn len(&self) -> u16 {
        self.entries.len().min(usize::from(u16::MAX - 1)) as u16
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_id(&self, plant_id: u16) -> bool {
        plant_id >= 1 && plant_id <= self.len()
    }

    pub fn entry(&self, plant_id: u16) -> Option<&CatalogEntry> {
        if !self.contains_id(plant_id) {
            return None;
        }
        self.entries.get(usize::from(plant_id - 1))
    }

    pub fn plant(&self, plant_id: u16) -> Option<PlantRecord> {
        self.entry(plant_id).map(|e| e.to_plant(plant_id))
    }

    pub fn list_entry(&self, plant_id: u16) -> Option<PlantListEntry> {
        self.entry(plant_id).map(|e| PlantListEntry {
            plant_id,
            pack_id: BUILTIN_PACK_ID,
            version: 1,
            source: PlantSource::Builtin,
            name: FixedStr::new(e.common_name),
        })
    }

    /// Virtual pack 0, materialized on demand.
    pub fn pack(&self) -> PackRecord {
        PackRecord {
            pack_id: BUILTIN_PACK_ID,
            version: 1,
            name: FixedStr::new(BUILTIN_PACK_NAME),
            plant_ids: (1..=self.len()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub installed: usize,
    pub skipped: usize,
}

impl PackStore {
    /// Mirror every ROM plant that is not yet on flash. Idempotent; yields
    /// to the runtime every few records.
    pub async fn provision_defaults(&self) -> Result<ProvisionSummary, StoreError> {
        let total = self.catalog().len();
        let mut summary = ProvisionSummary::default();

        for plant_id in 1..=total {
            let Some(record) = self.catalog().plant(plant_id) else {
                continue;
            };
            match self.mirror_builtin(&record)? {
                InstallOutcome::Updated => summary.installed += 1,
                InstallOutcome::AlreadyCurrent => summary.skipped += 1,
            }
            if usize::from(plant_id) % PROVISION_YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        info!(
            installed = summary.installed,
            skipped = summary.skipped,
            total,
            "catalog: provisioning finished"
        );
        Ok(summary)
    }

    /// Provision when the first or last built-in id is missing from flash.
    /// Returns whether provisioning ran.
    pub async fn ensure_provisioned(&self) -> Result<bool, StoreError> {
        let total = self.catalog().len();
        if total == 0 {
            return Ok(false);
        }
        let first = self.get_plant(1);
        let last = self.get_plant(total);
        if first.is_ok() && last.is_ok() {
            return Ok(false);
        }
        if let Err(e) = first.and(last) {
            warn!("catalog: built-in mirror incomplete ({e}), provisioning");
        }
        self.provision_defaults().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builtin_table_is_valid() {
        let cat = Catalog::builtin();
        assert_eq!(cat.len(), 30);
        for id in 1..=cat.len() {
            let plant = cat.plant(id).unwrap();
            plant
                .check_bounds()
                .unwrap_or_else(|e| panic!("ROM plant {id} invalid: {e}"));
            assert_eq!(plant.pack_id, 0);
            assert_eq!(plant.version, 1);
        }
    }

    #[test]
    fn projection_fills_default_knobs() {
        let plant = Catalog::builtin().plant(1).unwrap();
        assert_eq!(plant.common_name.as_str(), "Tomato");
        assert_eq!(plant.root_depth_min_mm, 700);
        assert_eq!(plant.root_depth_max_mm, 1500);
        assert_eq!(plant.spacing_row_mm, 1000);
        assert_eq!(plant.density_x100, 200);
        assert_eq!(plant.water_need_factor_x100, 100);
        assert_eq!(plant.irrigation_freq_days, 3);
        assert!(plant.prefer_area_based);
    }

    #[test]
    fn ids_are_one_based() {
        let cat = Catalog::take(15);
        assert!(!cat.contains_id(0));
        assert!(cat.contains_id(1));
        assert!(cat.contains_id(15));
        assert!(!cat.contains_id(16));
        assert_eq!(cat.list_entry(15).unwrap().source, PlantSource::Builtin);
    }

    #[test]
    fn virtual_pack_lists_every_id() {
        let pack = Catalog::take(4).pack();
        assert_eq!(pack.pack_id, 0);
        assert_eq!(pack.name.as_str(), BUILTIN_PACK_NAME);
        assert_eq!(pack.plant_ids, vec![1, 2, 3, 4]);
    }

    // -- Provisioning -------------------------------------------------------

    #[tokio::test]
    async fn provisioning_mirrors_catalog_once() {
        let dir = tempdir().unwrap();
        let store = PackStore::open(dir.path(), Catalog::take(25)).unwrap();

        let first = store.provision_defaults().await.unwrap();
        assert_eq!(first.installed, 25);
        assert_eq!(store.get_plant_count(), 25);
        let counter = store.change_counter();

        let second = store.provision_defaults().await.unwrap();
        assert_eq!(second, ProvisionSummary { installed: 0, skipped: 25 });
        assert_eq!(store.change_counter(), counter);
        assert_eq!(
            store.get_plant(25).unwrap(),
            Catalog::take(25).plant(25).unwrap()
        );
    }

    #[tokio::test]
    async fn ensure_provisioned_runs_only_when_missing() {
        let dir = tempdir().unwrap();
        let store = PackStore::open(dir.path(), Catalog::take(5)).unwrap();

        assert!(store.ensure_provisioned().await.unwrap());
        assert!(!store.ensure_provisioned().await.unwrap());

        store.delete_plant(5).unwrap();
        assert!(store.ensure_provisioned().await.unwrap());
        assert!(store.get_plant(5).is_ok());
    }
}
