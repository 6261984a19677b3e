use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::campaigns::{CampaignData, CpmKey, CpmStats, Product};

/// z for a 95% two-sided interval.
pub const WILSON_Z: f64 = 1.959963984540054;

/// Raw daily order row for one (legal entity, product, day): unit count,
/// total receipts, base cost per unit and the itemized fee columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRow {
    pub legal_entity: String,
    pub product_id: u64,
    pub date: NaiveDate,
    pub units: f64,
    pub revenue: f64,
    pub cost_per_unit: f64,
    pub commission: f64,
    pub storage: f64,
    pub logistics: f64,
    pub acquiring: f64,
    pub cross_docking: f64,
    pub fulfillment: f64,
}

impl OrderRow {
    fn total_fees(&self) -> f64 {
        self.commission
            + self.storage
            + self.logistics
            + self.acquiring
            + self.cross_docking
            + self.fulfillment
    }
}

/// Raw hourly ad-campaign row. Counters are cumulative within a day per
/// (date, product, campaign, platform) and reset at midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdRow {
    pub date: NaiveDate,
    pub hour: u32,
    pub product_id: u64,
    pub campaign_id: u64,
    pub platform: String,
    pub views: f64,
    pub clicks: f64,
    pub carts: f64,
    pub orders: f64,
    pub spend: f64,
}

/// Hour-of-week bucket, 0..168, Monday 00:00 = 0.
pub fn hour_of_week(date: NaiveDate, hour: u32) -> u32 {
    date.weekday().num_days_from_monday() * 24 + hour
}

/// `num / den`, or `None` when the denominator is not positive. Every
/// derived rate in this module goes through here so a zero denominator can
/// never leak out as NaN or infinity.
fn ratio(num: f64, den: f64) -> Option<f64> {
    if den > 0.0 {
        Some(num / den)
    } else {
        None
    }
}

/// 95%-style Wilson score interval on `successes / trials`. Chosen over the
/// normal approximation because hourly order counts are small and rates sit
/// near 0, where the normal interval collapses or leaves [0, 1].
pub fn wilson_interval(successes: f64, trials: f64, z: f64) -> Option<(f64, f64)> {
    if trials <= 0.0 {
        return None;
    }
    let p = successes / trials;
    let z2 = z * z;
    let denom = 1.0 + z2 / trials;
    let center = p + z2 / (2.0 * trials);
    let spread = z * (p * (1.0 - p) / trials + z2 / (4.0 * trials * trials)).sqrt();
    let low = ((center - spread) / denom).max(0.0);
    let high = ((center + spread) / denom).min(1.0);
    Some((low, high))
}

/// One hour of true (de-cumulated) activity for a (product, campaign) pair,
/// platforms summed, with every derived rate resolved to `None` rather than
/// a division-by-zero artifact.
#[derive(Debug, Clone, Serialize)]
pub struct HourlyRecord {
    pub date: NaiveDate,
    pub hour: u32,
    pub product_id: u64,
    pub campaign_id: u64,
    pub views: f64,
    pub clicks: f64,
    pub carts: f64,
    pub orders: f64,
    pub spend: f64,
    pub cpm: Option<f64>,
    pub ctr: Option<f64>,
    pub view_order_rate: Option<f64>,
    pub click_order_rate: Option<f64>,
    pub margin: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    views: f64,
    clicks: f64,
    carts: f64,
    orders: f64,
    spend: f64,
}

impl Counters {
    /// Hourly increment against the previous cumulative row of the same
    /// day. No previous row means the cumulative value is the increment.
    /// Negative differences (mid-day counter glitches) clamp to 0.
    fn increment_from(&self, prev: Option<&Counters>) -> Counters {
        match prev {
            None => *self,
            Some(p) => Counters {
                views: (self.views - p.views).max(0.0),
                clicks: (self.clicks - p.clicks).max(0.0),
                carts: (self.carts - p.carts).max(0.0),
                orders: (self.orders - p.orders).max(0.0),
                spend: (self.spend - p.spend).max(0.0),
            },
        }
    }

    fn add(&mut self, other: &Counters) {
        self.views += other.views;
        self.clicks += other.clicks;
        self.carts += other.carts;
        self.orders += other.orders;
        self.spend += other.spend;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MarginAcc {
    sum: f64,
    n: f64,
    max: f64,
}

impl MarginAcc {
    fn push(&mut self, margin: f64) {
        if self.n == 0.0 || margin > self.max {
            self.max = margin;
        }
        self.sum += margin;
        self.n += 1.0;
    }

    fn avg(&self) -> Option<f64> {
        ratio(self.sum, self.n)
    }

    fn max(&self) -> Option<f64> {
        if self.n > 0.0 {
            Some(self.max)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default)]
struct CpmAcc {
    views: f64,
    clicks: f64,
    carts: f64,
    orders: f64,
    margin: MarginAcc,
}

#[derive(Debug, Clone, Copy, Default)]
struct CostAcc {
    ratio_sum: f64,
    ratio_n: f64,
    cost_sum: f64,
    cost_n: f64,
    revenue: f64,
    units: f64,
}

/// Turns raw order and hourly ad-campaign rows into the per-product cost
/// ratios, per-pair margin aggregates and per-CPM history the decision
/// engine consumes. Rebuilt from scratch every run; holds no state between
/// invocations.
pub struct StatAggregator {
    records: Vec<HourlyRecord>,
    product_costs: HashMap<u64, CostAcc>,
    entity_ratio: HashMap<(String, u64), (f64, f64)>,
    global_ratio: Option<f64>,
    campaign_hour_margin: HashMap<(u64, u32), MarginAcc>,
    hour_margin: HashMap<u32, MarginAcc>,
    overall_margin: MarginAcc,
    cpm_table: HashMap<(u64, u32), BTreeMap<CpmKey, CpmAcc>>,
}

impl StatAggregator {
    pub fn build(order_rows: &[OrderRow], ad_rows: &[AdRow]) -> Self {
        let mut agg = Self {
            records: Vec::new(),
            product_costs: HashMap::new(),
            entity_ratio: HashMap::new(),
            global_ratio: None,
            campaign_hour_margin: HashMap::new(),
            hour_margin: HashMap::new(),
            overall_margin: MarginAcc::default(),
            cpm_table: HashMap::new(),
        };
        agg.aggregate_costs(order_rows);
        agg.aggregate_ads(ad_rows);
        agg
    }

    fn aggregate_costs(&mut self, rows: &[OrderRow]) {
        let kept: Vec<&OrderRow> = rows.iter().filter(|r| r.units > 0.0).collect();

        // Column mean of the positive base costs imputes the non-positive
        // ones, which the source data uses as a missing marker.
        let mut cost_sum = 0.0;
        let mut cost_n = 0.0;
        for r in &kept {
            if r.cost_per_unit > 0.0 {
                cost_sum += r.cost_per_unit;
                cost_n += 1.0;
            }
        }
        let imputed_cost = ratio(cost_sum, cost_n);

        let mut global_sum = 0.0;
        let mut global_n = 0.0;
        for r in kept {
            let acc = self.product_costs.entry(r.product_id).or_default();
            acc.revenue += r.revenue;
            acc.units += r.units;

            let cost = if r.cost_per_unit > 0.0 {
                Some(r.cost_per_unit)
            } else {
                imputed_cost
            };
            let Some(cost) = cost else { continue };

            let fees = r.total_fees() / r.units;
            let fee_ratio = (cost + fees) / cost;
            acc.cost_sum += cost;
            acc.cost_n += 1.0;
            acc.ratio_sum += fee_ratio;
            acc.ratio_n += 1.0;

            let entity = self
                .entity_ratio
                .entry((r.legal_entity.clone(), r.product_id))
                .or_insert((0.0, 0.0));
            entity.0 += fee_ratio;
            entity.1 += 1.0;

            global_sum += fee_ratio;
            global_n += 1.0;
        }
        self.global_ratio = ratio(global_sum, global_n);
        debug!(products = self.product_costs.len(), "aggregated order costs");
    }

    fn aggregate_ads(&mut self, rows: &[AdRow]) {
        // Unwind the cumulative counters per (date, product, campaign,
        // platform) series, ordered by hour.
        let mut series: BTreeMap<(NaiveDate, u64, u64, String), BTreeMap<u32, Counters>> =
            BTreeMap::new();
        for r in rows {
            series
                .entry((r.date, r.product_id, r.campaign_id, r.platform.clone()))
                .or_default()
                .insert(
                    r.hour,
                    Counters {
                        views: r.views,
                        clicks: r.clicks,
                        carts: r.carts,
                        orders: r.orders,
                        spend: r.spend,
                    },
                );
        }

        // Sum platforms together per (date, hour, product, campaign).
        let mut hourly: BTreeMap<(NaiveDate, u32, u64, u64), Counters> = BTreeMap::new();
        for ((date, product_id, campaign_id, _platform), by_hour) in &series {
            let mut prev: Option<&Counters> = None;
            for (hour, cumulative) in by_hour {
                let inc = cumulative.increment_from(prev);
                hourly
                    .entry((*date, *hour, *product_id, *campaign_id))
                    .or_default()
                    .add(&inc);
                prev = Some(cumulative);
            }
        }

        for ((date, hour, product_id, campaign_id), c) in hourly {
            if c.orders > c.views {
                // Corrupt counters; dropping the row beats poisoning the
                // aggregates with an impossible conversion rate.
                warn!(product_id, campaign_id, %date, hour, "orders exceed views, row dropped");
                continue;
            }

            let cpm = ratio(c.spend, c.views);
            let margin = self.hourly_margin(product_id, &c);
            let how = hour_of_week(date, hour);

            if let Some(m) = margin {
                self.campaign_hour_margin
                    .entry((campaign_id, how))
                    .or_default()
                    .push(m);
                self.hour_margin.entry(how).or_default().push(m);
                self.overall_margin.push(m);
            }

            if c.views > 0.0 {
                if let Some(cpm) = cpm {
                    let acc = self
                        .cpm_table
                        .entry((campaign_id, how))
                        .or_default()
                        .entry(CpmKey::from_cpm(cpm.round()))
                        .or_default();
                    acc.views += c.views;
                    acc.clicks += c.clicks;
                    acc.carts += c.carts;
                    acc.orders += c.orders;
                    if let Some(m) = margin {
                        acc.margin.push(m);
                    }
                }
            }

            self.records.push(HourlyRecord {
                date,
                hour,
                product_id,
                campaign_id,
                views: c.views,
                clicks: c.clicks,
                carts: c.carts,
                orders: c.orders,
                spend: c.spend,
                cpm,
                ctr: ratio(c.clicks, c.views),
                view_order_rate: ratio(c.orders, c.views),
                click_order_rate: ratio(c.orders, c.clicks),
                margin,
            });
        }
        debug!(records = self.records.len(), "aggregated hourly ad rows");
    }

    /// Margin without other expenses for one hour:
    /// (revenue - fee-inclusive cost of goods - ad spend) / revenue.
    /// An hour with zero orders is exactly 0 by definition; an hour with
    /// orders but no usable product snapshot has no margin.
    fn hourly_margin(&self, product_id: u64, c: &Counters) -> Option<f64> {
        if c.orders == 0.0 {
            return Some(0.0);
        }
        let product = self.product(product_id)?;
        let revenue = product.price * c.orders;
        Some((revenue - product.cost * c.orders - c.spend) / revenue)
    }

    /// The de-cumulated hourly records, in (date, hour, product, campaign)
    /// order.
    pub fn hourly_records(&self) -> &[HourlyRecord] {
        &self.records
    }

    /// Mean fee-inclusive cost ratio for one (legal entity, product).
    pub fn fee_ratio(&self, legal_entity: &str, product_id: u64) -> Option<f64> {
        let (sum, n) = self
            .entity_ratio
            .get(&(legal_entity.to_string(), product_id))?;
        ratio(*sum, *n)
    }

    /// Mean fee-inclusive cost ratio across all order rows.
    pub fn global_fee_ratio(&self) -> Option<f64> {
        self.global_ratio
    }

    /// The product's own mean ratio, or the global mean for products that
    /// never appeared in the order rows with a usable cost.
    fn product_fee_ratio(&self, product_id: u64) -> Option<f64> {
        self.product_costs
            .get(&product_id)
            .and_then(|acc| ratio(acc.ratio_sum, acc.ratio_n))
            .or(self.global_ratio)
    }

    /// Per-run product snapshot: average receipt as the sale price, mean
    /// base cost scaled by the fee ratio as the fee-inclusive unit cost.
    pub fn product(&self, product_id: u64) -> Option<Product> {
        let acc = self.product_costs.get(&product_id)?;
        let price = ratio(acc.revenue, acc.units)?;
        let base_cost = ratio(acc.cost_sum, acc.cost_n)?;
        let fee_ratio = self.product_fee_ratio(product_id)?;
        Some(Product {
            product_id,
            price,
            cost: base_cost * fee_ratio,
        })
    }

    /// All-time mean margin across every campaign and hour.
    pub fn overall_avg_margin(&self) -> Option<f64> {
        self.overall_margin.avg()
    }

    /// Assemble the aggregate bundle for one (campaign, hour-of-week) pair.
    /// Every absent aggregate stays `None`.
    pub fn campaign_data(&self, campaign_id: u64, hour_of_week: u32) -> CampaignData {
        let key = (campaign_id, hour_of_week);
        let cpm_stats = self
            .cpm_table
            .get(&key)
            .map(|table| {
                table
                    .iter()
                    .filter_map(|(cpm_key, acc)| {
                        // Only rows with an observed margin and a computable
                        // interval make the table.
                        let avg_margin = acc.margin.avg()?;
                        let (low, high) = wilson_interval(acc.orders, acc.views, WILSON_Z)?;
                        Some((
                            *cpm_key,
                            CpmStats {
                                views: acc.views,
                                clicks: acc.clicks,
                                carts: acc.carts,
                                orders: acc.orders,
                                avg_margin,
                                order_rate_low: low,
                                order_rate_high: high,
                            },
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        CampaignData {
            avg_margin: self
                .campaign_hour_margin
                .get(&key)
                .and_then(|a| a.avg()),
            max_margin: self
                .campaign_hour_margin
                .get(&key)
                .and_then(|a| a.max()),
            cpm_stats,
            hourly_avg_margin: self.hour_margin.get(&hour_of_week).and_then(|a| a.avg()),
            hourly_max_margin: self.hour_margin.get(&hour_of_week).and_then(|a| a.max()),
            overall_avg_margin: self.overall_margin.avg(),
        }
    }
}
