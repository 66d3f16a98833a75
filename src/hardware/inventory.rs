//! Device Inventory
//!
//! An explicit collection of the components of one instrument, passed to the
//! procedures that need to look components up. There is no global registry:
//! the caller builds the inventory and hands it over.
//!
//! Components are found by role and by topology (which component affects
//! which). For an alignment mode, [`DeviceInventory::resolve`] picks:
//!
//! | Component | Rule |
//! |-----------|------|
//! | focuser | role `focus` (`spec-focus`, `streak-focus`) or `spec-ded-focus` (`*-ext`); for `spec-fiber-focus`, the one of `spec-ded-focus`/`focus` affecting everything the `fiber-aligner` affects |
//! | detectors | components affected by the focuser with a role starting with `ccd` or `sp-ccd`, sorted by role |
//! | spectrograph | `spectrograph` or `spectrograph-dedicated`, affecting all detectors |
//! | selector | `spec-det-selector` or `spec-ded-det-selector`, affecting all detectors, only with several detectors |
//! | light | `brightlight` or `brightlight-ext`, affecting the first detector |
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let mut inventory = DeviceInventory::new();
//! inventory.add_focuser(focuser)?;
//! inventory.add_detector(ccd)?;
//! inventory.add_spectrograph(spectrograph)?;
//! inventory.add_light(light)?;
//!
//! let components = inventory.resolve(AlignMode::SpecFocus)?;
//! ```

use crate::error::{AfResult, AutofocusError};
use crate::hardware::capabilities::{
    Component, Detector, Focuser, LightSource, Selector, Spectrograph,
};
use crate::procedures::AlignMode;
use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Roles of the components switching the light on during focusing
const LIGHT_ROLES: [&str; 2] = ["brightlight", "brightlight-ext"];
const SPECTROGRAPH_ROLES: [&str; 2] = ["spectrograph", "spectrograph-dedicated"];
const SELECTOR_ROLES: [&str; 2] = ["spec-det-selector", "spec-ded-det-selector"];
const FIBER_FOCUSER_ROLES: [&str; 2] = ["spec-ded-focus", "focus"];

/// Capability under which a component was registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// Focus actuator
    Focuser,
    /// Image or signal producer
    Detector,
    /// Grating/wavelength actuator
    Spectrograph,
    /// Detector selector
    Selector,
    /// Light source
    Light,
    /// Any other component (e.g. fiber aligner), only used for topology
    Other,
}

/// Information about a registered component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    /// Unique name
    pub name: String,
    /// Role
    pub role: String,
    /// Registered capability
    pub kind: ComponentKind,
}

/// Components taking part in a spectrograph focus procedure
#[derive(Clone)]
pub struct FocusComponents {
    /// Focus actuator
    pub focuser: Arc<dyn Focuser>,
    /// Spectrograph in front of the detectors
    pub spectrograph: Arc<dyn Spectrograph>,
    /// Detectors, sorted by role; the first one is used to check the light
    pub detectors: Vec<Arc<dyn Detector>>,
    /// Selector, present when there are several detectors
    pub selector: Option<Arc<dyn Selector>>,
    /// Light source illuminating the first detector
    pub light: Arc<dyn LightSource>,
}

impl fmt::Debug for FocusComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusComponents")
            .field("focuser", &self.focuser.name())
            .field("spectrograph", &self.spectrograph.name())
            .field(
                "detectors",
                &self.detectors.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("selector", &self.selector.as_ref().map(|s| s.name()))
            .field("light", &self.light.name())
            .finish()
    }
}

/// Collection of the components of one instrument
#[derive(Default)]
pub struct DeviceInventory {
    focusers: Vec<Arc<dyn Focuser>>,
    detectors: Vec<Arc<dyn Detector>>,
    spectrographs: Vec<Arc<dyn Spectrograph>>,
    selectors: Vec<Arc<dyn Selector>>,
    lights: Vec<Arc<dyn LightSource>>,
    others: Vec<Arc<dyn Component>>,
    infos: Vec<ComponentInfo>,
    names: HashSet<String>,
}

impl DeviceInventory {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    fn claim<T: Component + ?Sized>(&mut self, component: &T, kind: ComponentKind) -> Result<()> {
        if !self.names.insert(component.name().to_string()) {
            return Err(anyhow!(
                "Component '{}' is already registered",
                component.name()
            ));
        }
        self.infos.push(ComponentInfo {
            name: component.name().to_string(),
            role: component.role().to_string(),
            kind,
        });
        Ok(())
    }

    /// Register a focus actuator
    pub fn add_focuser(&mut self, focuser: Arc<dyn Focuser>) -> Result<()> {
        self.claim(focuser.as_ref(), ComponentKind::Focuser)?;
        self.focusers.push(focuser);
        Ok(())
    }

    /// Register a detector
    pub fn add_detector(&mut self, detector: Arc<dyn Detector>) -> Result<()> {
        self.claim(detector.as_ref(), ComponentKind::Detector)?;
        self.detectors.push(detector);
        Ok(())
    }

    /// Register a spectrograph
    pub fn add_spectrograph(&mut self, spectrograph: Arc<dyn Spectrograph>) -> Result<()> {
        self.claim(spectrograph.as_ref(), ComponentKind::Spectrograph)?;
        self.spectrographs.push(spectrograph);
        Ok(())
    }

    /// Register a detector selector
    pub fn add_selector(&mut self, selector: Arc<dyn Selector>) -> Result<()> {
        self.claim(selector.as_ref(), ComponentKind::Selector)?;
        self.selectors.push(selector);
        Ok(())
    }

    /// Register a light source
    pub fn add_light(&mut self, light: Arc<dyn LightSource>) -> Result<()> {
        self.claim(light.as_ref(), ComponentKind::Light)?;
        self.lights.push(light);
        Ok(())
    }

    /// Register a component only used for topology
    pub fn add_component(&mut self, component: Arc<dyn Component>) -> Result<()> {
        self.claim(component.as_ref(), ComponentKind::Other)?;
        self.others.push(component);
        Ok(())
    }

    /// List all registered components, in registration order
    pub fn list(&self) -> Vec<ComponentInfo> {
        self.infos.clone()
    }

    /// Check if a component is registered
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Number of registered components
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Check if the inventory is empty
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Detector by name
    pub fn detector(&self, name: &str) -> Option<Arc<dyn Detector>> {
        self.detectors.iter().find(|d| d.name() == name).cloned()
    }

    /// Light source by role
    pub fn light_by_role(&self, role: &str) -> Option<Arc<dyn LightSource>> {
        by_role(&self.lights, role)
    }

    /// Focus actuator used for `mode`
    pub fn find_focuser(&self, mode: AlignMode) -> AfResult<Arc<dyn Focuser>> {
        let focuser = match mode {
            AlignMode::SpecFocus | AlignMode::StreakFocus => by_role(&self.focusers, "focus"),
            AlignMode::SpecFocusExt | AlignMode::StreakFocusExt => {
                by_role(&self.focusers, "spec-ded-focus")
            }
            AlignMode::SpecFiberFocus => {
                let aligner = by_role(&self.others, "fiber-aligner").ok_or_else(|| {
                    AutofocusError::InvalidConfiguration(
                        "No fiber-aligner found for spec-fiber-focus".to_string(),
                    )
                })?;
                find_same_affects(&self.focusers, &FIBER_FOCUSER_ROLES, &aligner.affects())
            }
        };

        focuser.ok_or_else(|| {
            AutofocusError::InvalidConfiguration(format!(
                "Failed to find the focuser for align mode {mode}"
            ))
        })
    }

    /// Detectors behind the spectrograph affected by `focuser`, in `affects` order
    pub fn spectrometer_detectors(&self, focuser: &dyn Focuser) -> Vec<Arc<dyn Detector>> {
        let mut detectors = Vec::new();
        for name in focuser.affects() {
            match self.detector(&name) {
                Some(d) if d.role().starts_with("ccd") || d.role().starts_with("sp-ccd") => {
                    detectors.push(d);
                }
                Some(_) => {}
                None => info!("Focuser affects non-existing detector {}", name),
            }
        }
        detectors
    }

    /// All the components needed to focus the spectrograph in `mode`
    pub fn resolve(&self, mode: AlignMode) -> AfResult<FocusComponents> {
        let focuser = self.find_focuser(mode)?;
        self.components_for(focuser).map_err(|reason| {
            AutofocusError::InvalidConfiguration(format!(
                "Failed to focus in mode {mode}: {reason}"
            ))
        })
    }

    fn components_for(&self, focuser: Arc<dyn Focuser>) -> Result<FocusComponents, String> {
        let mut detectors = self.spectrometer_detectors(focuser.as_ref());
        if detectors.is_empty() {
            return Err("no detector found for the spectrometer focusing".to_string());
        }
        // The first detector is used to check the light: keep it reproducible
        detectors.sort_by(|a, b| a.role().cmp(b.role()));
        let names: Vec<String> = detectors.iter().map(|d| d.name().to_string()).collect();

        let spectrograph = find_same_affects(&self.spectrographs, &SPECTROGRAPH_ROLES, &names)
            .ok_or_else(|| missing(&SPECTROGRAPH_ROLES, &names))?;

        let selector = if detectors.len() > 1 {
            Some(
                find_same_affects(&self.selectors, &SELECTOR_ROLES, &names)
                    .ok_or_else(|| missing(&SELECTOR_ROLES, &names))?,
            )
        } else {
            None
        };

        let first = &names[..1];
        let light = find_same_affects(&self.lights, &LIGHT_ROLES, first)
            .ok_or_else(|| missing(&LIGHT_ROLES, first))?;

        debug!(
            focuser = focuser.name(),
            spectrograph = spectrograph.name(),
            detectors = ?names,
            "resolved focus components"
        );

        Ok(FocusComponents {
            focuser,
            spectrograph,
            detectors,
            selector,
            light,
        })
    }

    /// Light source for a manual focus in `mode`
    ///
    /// Falls back to the `brightlight` component when the full set of
    /// components cannot be resolved.
    pub fn manual_focus_light(&self, mode: AlignMode) -> AfResult<Arc<dyn LightSource>> {
        match self.resolve(mode) {
            Ok(components) => Ok(components.light),
            Err(err) => {
                warn!(
                    "Failed to find all the components for focusing mode {}, will just use the brightlight: {}",
                    mode, err
                );
                self.light_by_role("brightlight").ok_or_else(|| {
                    AutofocusError::InvalidConfiguration(format!(
                        "No brightlight available for manual focus in mode {mode}"
                    ))
                })
            }
        }
    }
}

fn missing(roles: &[&str], affected: &[String]) -> String {
    format!(
        "failed to find a component within {:?} that affects all {:?}",
        roles, affected
    )
}

fn by_role<T: Component + ?Sized>(pool: &[Arc<T>], role: &str) -> Option<Arc<T>> {
    pool.iter().find(|c| c.role() == role).cloned()
}

/// First component, by order of `roles`, affecting all of `affected`
fn find_same_affects<T: Component + ?Sized>(
    pool: &[Arc<T>],
    roles: &[&str],
    affected: &[String],
) -> Option<Arc<T>> {
    for role in roles {
        let Some(candidate) = by_role(pool, role) else {
            debug!("No component with role {} found", role);
            continue;
        };
        let affects: HashSet<String> = candidate.affects().into_iter().collect();
        if affected.iter().all(|name| affects.contains(name)) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::DetectorKind;
    use crate::hardware::mock::{MockCamera, MockFocuser, MockLight, MockSelector, MockSpectrograph};

    struct Aligner;

    impl Component for Aligner {
        fn name(&self) -> &str {
            "fiber-aligner"
        }
        fn role(&self) -> &str {
            "fiber-aligner"
        }
        fn affects(&self) -> Vec<String> {
            vec!["sp-ccd-ext".to_string()]
        }
    }

    fn camera(name: &str, role: &str) -> Arc<MockCamera> {
        Arc::new(MockCamera::new(name, role, DetectorKind::Camera, (1, 1)))
    }

    fn two_detector_inventory() -> DeviceInventory {
        let mut inv = DeviceInventory::new();
        inv.add_focuser(Arc::new(
            MockFocuser::new("focus", "focus", (0.0, 1e-3)).with_affects(&["ccd1", "ccd0", "sem-det"]),
        ))
        .unwrap();
        inv.add_detector(camera("ccd0", "ccd")).unwrap();
        inv.add_detector(camera("ccd1", "sp-ccd")).unwrap();
        inv.add_detector(camera("sem-det", "se-detector")).unwrap();
        inv.add_spectrograph(Arc::new(
            MockSpectrograph::new("sp", "spectrograph", &[1, 2]).with_affects(&["ccd0", "ccd1"]),
        ))
        .unwrap();
        inv.add_selector(Arc::new(
            MockSelector::new("sel", "spec-det-selector", &[(0.0, "ccd0"), (1.0, "ccd1")])
                .with_affects(&["ccd0", "ccd1"]),
        ))
        .unwrap();
        inv.add_light(Arc::new(
            MockLight::new("bl", "brightlight", 1.0).with_affects(&["ccd0"]),
        ))
        .unwrap();
        inv
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut inv = DeviceInventory::new();
        inv.add_detector(camera("ccd0", "ccd")).unwrap();
        assert!(inv.add_detector(camera("ccd0", "ccd")).is_err());
        assert_eq!(inv.len(), 1);
        assert!(inv.contains("ccd0"));
    }

    #[test]
    fn test_list_in_registration_order() {
        let inv = two_detector_inventory();
        let listed: Vec<(String, ComponentKind)> =
            inv.list().into_iter().map(|info| (info.name, info.kind)).collect();
        assert_eq!(
            listed,
            vec![
                ("focus".to_string(), ComponentKind::Focuser),
                ("ccd0".to_string(), ComponentKind::Detector),
                ("ccd1".to_string(), ComponentKind::Detector),
                ("sem-det".to_string(), ComponentKind::Detector),
                ("sp".to_string(), ComponentKind::Spectrograph),
                ("sel".to_string(), ComponentKind::Selector),
                ("bl".to_string(), ComponentKind::Light),
            ]
        );
        assert_eq!(inv.list()[5].role, "spec-det-selector");
    }

    #[test]
    fn test_resolve_two_detectors() {
        let inv = two_detector_inventory();
        let comps = inv.resolve(AlignMode::SpecFocus).unwrap();
        assert_eq!(comps.focuser.name(), "focus");
        assert_eq!(comps.spectrograph.name(), "sp");
        // sorted by role: "ccd" < "sp-ccd"
        let names: Vec<_> = comps.detectors.iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["ccd0", "ccd1"]);
        assert_eq!(comps.selector.map(|s| s.name().to_string()), Some("sel".to_string()));
        assert_eq!(comps.light.name(), "bl");
    }

    #[test]
    fn test_missing_focuser() {
        let inv = two_detector_inventory();
        let err = inv.resolve(AlignMode::SpecFocusExt).unwrap_err();
        assert!(matches!(err, AutofocusError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_missing_light_is_invalid() {
        let mut inv = DeviceInventory::new();
        inv.add_focuser(Arc::new(
            MockFocuser::new("focus", "focus", (0.0, 1e-3)).with_affects(&["ccd0"]),
        ))
        .unwrap();
        inv.add_detector(camera("ccd0", "ccd")).unwrap();
        inv.add_spectrograph(Arc::new(
            MockSpectrograph::new("sp", "spectrograph", &[1]).with_affects(&["ccd0"]),
        ))
        .unwrap();
        match inv.resolve(AlignMode::StreakFocus) {
            Err(AutofocusError::InvalidConfiguration(msg)) => assert!(msg.contains("brightlight")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(inv.manual_focus_light(AlignMode::StreakFocus).is_err());
    }

    #[test]
    fn test_single_detector_needs_no_selector() {
        let mut inv = DeviceInventory::new();
        inv.add_focuser(Arc::new(
            MockFocuser::new("ded-focus", "spec-ded-focus", (0.0, 1e-3)).with_affects(&["ccd-ext"]),
        ))
        .unwrap();
        inv.add_detector(camera("ccd-ext", "sp-ccd")).unwrap();
        inv.add_spectrograph(Arc::new(
            MockSpectrograph::new("sp-ded", "spectrograph-dedicated", &[1]).with_affects(&["ccd-ext"]),
        ))
        .unwrap();
        inv.add_light(Arc::new(
            MockLight::new("bl-ext", "brightlight-ext", 1.0).with_affects(&["ccd-ext"]),
        ))
        .unwrap();

        let comps = inv.resolve(AlignMode::SpecFocusExt).unwrap();
        assert!(comps.selector.is_none());
        assert_eq!(comps.spectrograph.name(), "sp-ded");
        assert_eq!(comps.light.name(), "bl-ext");
    }

    #[test]
    fn test_fiber_focus_picks_focuser_by_aligner() {
        let mut inv = DeviceInventory::new();
        inv.add_focuser(Arc::new(
            MockFocuser::new("focus", "focus", (0.0, 1e-3)).with_affects(&["ccd0"]),
        ))
        .unwrap();
        inv.add_focuser(Arc::new(
            MockFocuser::new("ded-focus", "spec-ded-focus", (0.0, 1e-3)).with_affects(&["ccd0"]),
        ))
        .unwrap();
        inv.add_focuser(Arc::new(
            MockFocuser::new("fiber-focus", "focus-fiber", (0.0, 1e-3)).with_affects(&["sp-ccd-ext"]),
        ))
        .unwrap();

        // Neither candidate affects what the aligner affects
        inv.add_component(Arc::new(Aligner)).unwrap();
        assert!(inv.find_focuser(AlignMode::SpecFiberFocus).is_err());

        let mut inv = DeviceInventory::new();
        inv.add_focuser(Arc::new(
            MockFocuser::new("focus", "focus", (0.0, 1e-3)).with_affects(&["sp-ccd-ext"]),
        ))
        .unwrap();
        inv.add_component(Arc::new(Aligner)).unwrap();
        let focuser = inv.find_focuser(AlignMode::SpecFiberFocus).unwrap();
        assert_eq!(focuser.name(), "focus");
    }
}
