use crate::{
    config::TestConfig,
    error::{Error, Result},
    network::ShapeSpec,
};

/// Values per ROI row: batch index followed by `x1, y1, x2, y2`.
pub const ROI_WIDTH: usize = 5;

/// How region proposals reach the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoiInput {
    /// The network generates its own proposals.
    Internal,
    /// Proposals are fed through a `rois` input holding at most
    /// `proposal_cap + margin` rows.
    External { proposal_cap: usize, margin: usize },
}

/// Computes the largest input shapes a test run binds for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxShapePolicy {
    pub scales: Vec<(usize, usize)>,
    pub rois: RoiInput,
}

impl MaxShapePolicy {
    pub fn from_config(config: &TestConfig, has_rpn: bool) -> Self {
        let rois = if has_rpn {
            RoiInput::Internal
        } else {
            RoiInput::External {
                proposal_cap: config.proposal_post_nms_top_n,
                margin: config.roi_margin,
            }
        };

        Self {
            scales: config.scales.clone(),
            rois,
        }
    }

    /// The envelope: `data` at `[1, 3, max height, max width]` with each axis
    /// maximized on its own, then `rois` when proposals are external.
    pub fn resolve(&self) -> Result<Vec<ShapeSpec>> {
        if self.scales.is_empty() {
            return Err(Error::Configuration("no test scales configured".into()));
        }
        if let Some(bad) = self.scales.iter().find(|(h, w)| *h == 0 || *w == 0) {
            return Err(Error::Configuration(format!("degenerate test scale {bad:?}")));
        }

        let max_h = self.scales.iter().map(|(h, _)| *h).max().unwrap_or_default();
        let max_w = self.scales.iter().map(|(_, w)| *w).max().unwrap_or_default();

        let mut shapes = vec![ShapeSpec::new("data", [1, 3, max_h, max_w])];

        if let RoiInput::External {
            proposal_cap,
            margin,
        } = self.rois
        {
            let rows = proposal_cap.checked_add(margin).ok_or_else(|| {
                Error::Configuration(format!(
                    "proposal cap {proposal_cap} plus roi margin {margin} overflows"
                ))
            })?;
            shapes.push(ShapeSpec::new("rois", [1, rows, ROI_WIDTH]));
        }

        Ok(shapes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axes_are_maximized_independently() {
        let policy = MaxShapePolicy {
            scales: vec![(600, 800), (800, 600)],
            rois: RoiInput::Internal,
        };

        assert_eq!(
            policy.resolve().unwrap(),
            vec![ShapeSpec::new("data", [1, 3, 800, 800])]
        );
    }

    #[test]
    fn test_external_proposals_add_roi_envelope() {
        let policy = MaxShapePolicy {
            scales: vec![(600, 1000)],
            rois: RoiInput::External {
                proposal_cap: 300,
                margin: 30,
            },
        };

        let shapes = policy.resolve().unwrap();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[1], ShapeSpec::new("rois", [1, 330, 5]));
    }

    #[test]
    fn test_empty_scales_fail_fast() {
        let policy = MaxShapePolicy {
            scales: vec![],
            rois: RoiInput::Internal,
        };

        assert!(matches!(policy.resolve(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_overflowing_roi_envelope_is_rejected() {
        let policy = MaxShapePolicy {
            scales: vec![(600, 1000)],
            rois: RoiInput::External {
                proposal_cap: usize::MAX,
                margin: 30,
            },
        };

        assert!(matches!(policy.resolve(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_zero_sized_scale_is_rejected() {
        let policy = MaxShapePolicy {
            scales: vec![(600, 0)],
            rois: RoiInput::Internal,
        };

        assert!(matches!(policy.resolve(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_from_config_uses_proposal_cap_and_margin() {
        let config = TestConfig::new()
            .with_scales(vec![(224, 224)])
            .with_proposal_post_nms_top_n(300);

        let rcnn = MaxShapePolicy::from_config(&config, false);
        assert_eq!(
            rcnn.rois,
            RoiInput::External {
                proposal_cap: 300,
                margin: 30
            }
        );

        let rpn = MaxShapePolicy::from_config(&config, true);
        assert_eq!(rpn.resolve().unwrap(), vec![ShapeSpec::new("data", [1, 3, 224, 224])]);
    }
}
