//! Best-effort annotation placement for rendered charts.
//!
//! Event annotations (headline + temperature line) are slotted into a small
//! set of horizontal lanes near the top of the plot. Greedy first-fit in
//! event order, with a scored fallback when every lane collides: O(events ×
//! lanes), deterministic, never fails. The renderer supplies measured box
//! sizes and pixel anchors and draws the result; no backend types leak in
//! here.

/// Number of stacked annotation lanes.
pub const LANE_COUNT: usize = 4;
/// Vertical gap between lanes, pixels.
const LANE_GAP: f64 = 4.0;
/// Offset of the first lane below the plot top, pixels.
const LANE_TOP_PAD: f64 = 6.0;

/// Axis-aligned rectangle in pixel space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Rect {
    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.x + other.w
            && other.x < self.x + self.w
            && self.y < other.y + other.h
            && other.y < self.y + self.h
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }
}

/// Pixel bounds of the plot area.
#[derive(Clone, Copy, Debug)]
pub struct PlotFrame {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

/// One annotation to place: the event's pixel anchor on the temperature
/// curve and the measured size of its two-line text box.
#[derive(Clone, Copy, Debug)]
pub struct LabelRequest {
    pub anchor_x: f64,
    pub anchor_y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Clone, Debug)]
pub struct PlacedLabel {
    pub rect: Rect,
    pub lane: usize,
    pub anchor_x: f64,
    pub anchor_y: f64,
    /// Boxes this one still overlaps; zero unless every lane collided.
    pub collisions: usize,
}

/// Candidate scoring, swappable without touching the placement loop.
pub trait PlacementScore {
    /// Lower is better. `placed` holds the labels already in the candidate's
    /// lane.
    fn score(&self, candidate: &Rect, placed: &[PlacedLabel]) -> f64;
}

/// Default scorer: the number of already-placed boxes the candidate crosses.
pub struct OverlapScore;

impl PlacementScore for OverlapScore {
    fn score(&self, candidate: &Rect, placed: &[PlacedLabel]) -> f64 {
        placed
            .iter()
            .filter(|label| label.rect.overlaps(candidate))
            .count() as f64
    }
}

fn lane_top(frame: &PlotFrame, lane: usize, height: f64) -> f64 {
    frame.top + LANE_TOP_PAD + lane as f64 * (height + LANE_GAP)
}

/// Assign each request a lane and rectangle. Requests are processed in the
/// order given (event lists arrive sorted by time) and the output is
/// index-aligned with the input.
pub fn place_labels(
    frame: &PlotFrame,
    requests: &[LabelRequest],
    scorer: &dyn PlacementScore,
) -> Vec<PlacedLabel> {
    let mut placed: Vec<PlacedLabel> = Vec::with_capacity(requests.len());

    for request in requests {
        let min_x = frame.left;
        let max_x = (frame.right - request.width).max(frame.left);
        let x = (request.anchor_x - request.width / 2.0).clamp(min_x, max_x);

        let mut fallback: Option<(f64, usize, Rect, usize)> = None;
        let mut chosen: Option<(usize, Rect)> = None;
        for lane in 0..LANE_COUNT {
            let rect = Rect {
                x,
                y: lane_top(frame, lane, request.height),
                w: request.width,
                h: request.height,
            };
            let in_lane: Vec<PlacedLabel> = placed
                .iter()
                .filter(|label| label.lane == lane)
                .cloned()
                .collect();
            let collisions = in_lane
                .iter()
                .filter(|label| label.rect.overlaps(&rect))
                .count();
            if collisions == 0 {
                chosen = Some((lane, rect));
                break;
            }
            let score = scorer.score(&rect, &in_lane);
            if fallback
                .as_ref()
                .map_or(true, |(best, _, _, _)| score < *best)
            {
                fallback = Some((score, lane, rect, collisions));
            }
        }

        let label = match (chosen, fallback) {
            (Some((lane, rect)), _) => PlacedLabel {
                rect,
                lane,
                anchor_x: request.anchor_x,
                anchor_y: request.anchor_y,
                collisions: 0,
            },
            (None, Some((_, lane, rect, collisions))) => PlacedLabel {
                rect,
                lane,
                anchor_x: request.anchor_x,
                anchor_y: request.anchor_y,
                collisions,
            },
            // LANE_COUNT is nonzero, so one of the two always exists.
            (None, None) => unreachable!("no candidate lanes"),
        };
        placed.push(label);
    }

    placed
}
